//! The lookup table backing the `app.getData` host callback.
//!
//! The table is a JSON object loaded once and never mutated afterwards.
//! Lookups render the stored value as compact JSON text; keys that are not
//! present render as the literal `null`. The ASCII rendering escapes every
//! non-ASCII character as `\uXXXX` so the answer fits a single-byte guest.

use std::io;
use std::path::Path;

use serde::Serialize;
use serde_json::ser::{Formatter, Serializer};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::GuestError;

/// Text returned for keys that are absent from the table.
pub const NULL_JSON: &str = "null";

/// Read-only key → JSON value document.
#[derive(Debug, Clone, Default)]
pub struct LookupTable {
    entries: Map<String, Value>,
}

impl LookupTable {
    /// Load a table from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`GuestError::TableIo`] if the file cannot be read, and the
    /// errors of [`LookupTable::from_json`] if its contents are rejected.
    pub fn from_file(path: &Path) -> Result<Self, GuestError> {
        let data = std::fs::read_to_string(path).map_err(|source| GuestError::TableIo {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::from_json(&data)?;
        debug!(path = %path.display(), entries = table.len(), "loaded lookup table");
        Ok(table)
    }

    /// Parse a table from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`GuestError::TableJson`] for malformed JSON and
    /// [`GuestError::TableNotObject`] when the top level is not an object.
    pub fn from_json(data: &str) -> Result<Self, GuestError> {
        match serde_json::from_str::<Value>(data)? {
            Value::Object(entries) => Ok(Self { entries }),
            other => Err(GuestError::TableNotObject(json_kind(&other))),
        }
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The stored value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Render the value for `key` as JSON text, or `null` when absent.
    pub fn lookup_json(&self, key: &str) -> String {
        self.get(key)
            .map_or_else(|| NULL_JSON.to_owned(), Value::to_string)
    }

    /// Like [`LookupTable::lookup_json`], but with non-ASCII characters in
    /// strings and keys escaped as `\uXXXX` (surrogate pairs above U+FFFF).
    ///
    /// # Errors
    ///
    /// Returns [`GuestError::TableJson`] if the value cannot be serialized.
    pub fn lookup_ascii_json(&self, key: &str) -> Result<String, GuestError> {
        let Some(value) = self.get(key) else {
            return Ok(NULL_JSON.to_owned());
        };

        let mut out = Vec::new();
        value.serialize(&mut Serializer::with_formatter(&mut out, AsciiFormatter))?;
        Ok(String::from_utf8(out)?)
    }
}

/// Compact formatter that never emits a non-ASCII byte.
struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut units = [0u16; 2];
        let mut start = 0;
        for (index, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(&fragment.as_bytes()[start..index])?;
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{unit:04x}")?;
            }
            start = index + ch.len_utf8();
        }
        writer.write_all(&fragment.as_bytes()[start..])
    }
}

impl From<Map<String, Value>> for LookupTable {
    fn from(entries: Map<String, Value>) -> Self {
        Self { entries }
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn present_key_renders_compact_json() {
        let table = LookupTable::from_json(
            r#"{"perm:42": true, "meeting:1": {"name": "standup", "ids": [1, 2]}}"#,
        )
        .unwrap();

        assert_eq!(table.lookup_json("perm:42"), "true");
        assert_eq!(
            table.lookup_json("meeting:1"),
            r#"{"name":"standup","ids":[1,2]}"#
        );
    }

    #[test]
    fn object_key_order_is_preserved() {
        let table = LookupTable::from_json(r#"{"k": {"zeta": 1, "alpha": 2}}"#).unwrap();
        assert_eq!(table.lookup_json("k"), r#"{"zeta":1,"alpha":2}"#);
    }

    #[test]
    fn absent_key_renders_null() {
        let table = LookupTable::from_json("{}").unwrap();
        assert!(table.is_empty());
        assert_eq!(table.lookup_json("perm:42"), "null");
    }

    #[test]
    fn stored_null_and_absent_key_look_alike() {
        let table = LookupTable::from_json(r#"{"nothing": null}"#).unwrap();
        assert_eq!(table.lookup_json("nothing"), table.lookup_json("missing"));
    }

    #[test]
    fn string_values_keep_their_quotes() {
        let table = LookupTable::from_json(r#"{"role": "admin"}"#).unwrap();
        assert_eq!(table.lookup_json("role"), r#""admin""#);
    }

    #[test]
    fn ascii_rendering_escapes_non_ascii() {
        let table = LookupTable::from_json(
            r#"{"a": "snow \u2603", "b": "café", "c": {"clé": "🎉"}, "d": [1, "plain"]}"#,
        )
        .unwrap();

        assert_eq!(table.lookup_ascii_json("a").unwrap(), r#""snow \u2603""#);
        assert_eq!(table.lookup_ascii_json("b").unwrap(), r#""caf\u00e9""#);
        assert_eq!(
            table.lookup_ascii_json("c").unwrap(),
            r#"{"cl\u00e9":"\ud83c\udf89"}"#
        );
        assert_eq!(table.lookup_ascii_json("d").unwrap(), r#"[1,"plain"]"#);
        assert_eq!(table.lookup_ascii_json("missing").unwrap(), "null");
    }

    #[test]
    fn ascii_rendering_keeps_control_escapes() {
        let table = LookupTable::from_json(r#"{"k": "tab\tquote\"é"}"#).unwrap();
        assert_eq!(
            table.lookup_ascii_json("k").unwrap(),
            r#""tab\tquote\"\u00e9""#
        );
    }

    #[test]
    fn non_object_top_level_is_rejected() {
        let err = LookupTable::from_json("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, GuestError::TableNotObject("an array")));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = LookupTable::from_json("{\"a\": ").unwrap_err();
        assert!(matches!(err, GuestError::TableJson(_)));
    }

    #[test]
    fn from_file_reads_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"perm:7": 1}}"#).unwrap();

        let table = LookupTable::from_file(file.path()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup_json("perm:7"), "1");
    }

    #[test]
    fn from_file_reports_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let err = LookupTable::from_file(&path).unwrap_err();
        assert!(matches!(err, GuestError::TableIo { .. }));
        assert!(err.to_string().contains("db.json"));
    }
}
