//! Error types for the permbridge host runtime.

use std::path::PathBuf;

/// Errors raised while loading, instantiating, or talking to a guest module.
#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    /// The guest module failed to compile.
    #[error("failed to load guest module: {0}")]
    Load(String),

    /// The guest module does not export something the host ABI requires.
    #[error("guest module does not export `{name}` as a {kind}")]
    MissingExport {
        /// Name of the missing export.
        name: &'static str,
        /// Expected export kind (`func` or `memory`).
        kind: &'static str,
    },

    /// Linking or instantiation failed.
    #[error("failed to instantiate guest module: {0}")]
    Instantiate(String),

    /// A pointer handed over by the guest does not reference valid memory.
    #[error("invalid guest pointer {pointer:#x}: {reason}")]
    InvalidGuestPointer {
        /// The offending pointer.
        pointer: u32,
        /// Which check rejected it.
        reason: &'static str,
    },

    /// A character cannot be represented in the configured string encoding.
    #[error("character {ch:?} cannot be encoded as a single byte")]
    Unencodable {
        /// The offending character.
        ch: char,
    },

    /// A host string contains a NUL character, which the guest would read
    /// as the end of the string.
    #[error("string contains an embedded NUL at byte {position}")]
    EmbeddedNul {
        /// Byte offset of the NUL.
        position: usize,
    },

    /// Guest bytes are not valid UTF-8.
    #[error("guest string is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// The guest trapped or a guest call failed.
    #[error("guest call `{function}` failed: {message}")]
    Trap {
        /// The export being called.
        function: &'static str,
        /// Rendered wasmtime error chain.
        message: String,
    },

    /// The lookup table file could not be read.
    #[error("failed to read lookup table `{}`: {source}", .path.display())]
    TableIo {
        /// Path of the table file.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The lookup table is not valid JSON.
    #[error("invalid lookup table: {0}")]
    TableJson(#[from] serde_json::Error),

    /// The lookup table's top level is not a JSON object.
    #[error("lookup table must be a JSON object, found {0}")]
    TableNotObject(&'static str),
}
