//! Guest memory bridge: moving strings across the linear-memory boundary.
//!
//! The guest ABI is asymmetric and must be matched byte-for-byte:
//!
//! - **host → guest**: the host calls the guest's `malloc(len + 1)`, copies
//!   the encoded bytes to the returned offset and appends a zero byte. The
//!   guest receives a bare pointer to a NUL-terminated run.
//! - **guest → host**: the guest hands over a pointer to an 8-byte record
//!   `{ data_pointer: u32, length: u32 }` (little-endian, 4-byte aligned)
//!   describing the bytes to read.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use tracing::trace;
use wasmtime::{AsContext, AsContextMut, Caller, Extern, Instance, Memory, Store, TypedFunc};

use crate::error::GuestError;

/// Byte width of a guest string record.
pub const RECORD_SIZE: usize = 8;

/// How host strings map to guest bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// One byte per character; only code points 0–255 are representable.
    #[default]
    Latin1,
    /// Standard UTF-8 bytes.
    Utf8,
}

impl Encoding {
    /// Encode `value` into guest bytes (without terminator).
    ///
    /// # Errors
    ///
    /// Returns [`GuestError::Unencodable`] for a character above U+00FF
    /// under [`Encoding::Latin1`].
    pub fn encode(self, value: &str) -> Result<Vec<u8>, GuestError> {
        match self {
            Self::Latin1 => value
                .chars()
                .map(|ch| u8::try_from(ch).map_err(|_| GuestError::Unencodable { ch }))
                .collect(),
            Self::Utf8 => Ok(value.as_bytes().to_vec()),
        }
    }

    /// Decode guest bytes into a host string.
    ///
    /// # Errors
    ///
    /// Returns [`GuestError::InvalidUtf8`] when [`Encoding::Utf8`] is
    /// selected and the bytes are not valid UTF-8. Latin-1 never fails.
    pub fn decode(self, bytes: Vec<u8>) -> Result<String, GuestError> {
        match self {
            Self::Latin1 => Ok(bytes.into_iter().map(char::from).collect()),
            Self::Utf8 => Ok(String::from_utf8(bytes)?),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Latin1 => "latin1",
            Self::Utf8 => "utf8",
        })
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "latin1" | "latin-1" | "iso-8859-1" => Ok(Self::Latin1),
            "utf8" | "utf-8" => Ok(Self::Utf8),
            other => Err(format!("unknown encoding '{other}' (expected latin1 or utf8)")),
        }
    }
}

/// A block obtained from the guest allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestAllocation {
    /// Base offset in linear memory.
    pub pointer: u32,
    /// Number of bytes requested from `malloc`.
    pub size: u32,
}

/// A decoded `{ data_pointer, length }` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestRecord {
    /// Offset of the first data byte.
    pub data_pointer: u32,
    /// Number of data bytes.
    pub length: u32,
}

/// Handles to the guest exports the bridge needs, plus the string encoding.
///
/// Resolved either from an [`Instance`] (host side, before calling into the
/// guest) or from a [`Caller`] (inside a host callback).
#[derive(Clone)]
pub struct GuestBridge {
    memory: Memory,
    malloc: TypedFunc<u32, u32>,
    free: Option<TypedFunc<(u32, u32), ()>>,
    encoding: Encoding,
}

impl GuestBridge {
    /// Resolve the bridge exports of a freshly created instance.
    ///
    /// # Errors
    ///
    /// Returns [`GuestError::MissingExport`] when `memory` or `malloc` is
    /// absent and [`GuestError::Instantiate`] when an export has the wrong
    /// signature.
    pub fn from_instance<T: 'static>(
        store: &mut Store<T>,
        instance: &Instance,
        encoding: Encoding,
    ) -> Result<Self, GuestError> {
        let memory = instance.get_export(&mut *store, "memory");
        let malloc = instance.get_export(&mut *store, "malloc");
        let free = instance.get_export(&mut *store, "free");
        Self::resolve(&*store, memory, malloc, free, encoding)
    }

    /// Resolve the bridge exports from inside a host callback.
    ///
    /// # Errors
    ///
    /// Same as [`GuestBridge::from_instance`].
    pub fn from_caller<T: 'static>(
        caller: &mut Caller<'_, T>,
        encoding: Encoding,
    ) -> Result<Self, GuestError> {
        let memory = caller.get_export("memory");
        let malloc = caller.get_export("malloc");
        let free = caller.get_export("free");
        Self::resolve(&*caller, memory, malloc, free, encoding)
    }

    fn resolve(
        store: impl AsContext,
        memory: Option<Extern>,
        malloc: Option<Extern>,
        free: Option<Extern>,
        encoding: Encoding,
    ) -> Result<Self, GuestError> {
        let memory = memory
            .and_then(Extern::into_memory)
            .ok_or(GuestError::MissingExport {
                name: "memory",
                kind: "memory",
            })?;
        let malloc = malloc
            .and_then(Extern::into_func)
            .ok_or(GuestError::MissingExport {
                name: "malloc",
                kind: "func",
            })?
            .typed::<u32, u32>(&store)
            .map_err(|e| GuestError::Instantiate(format!("`malloc` has the wrong signature: {e}")))?;
        let free = match free.and_then(Extern::into_func) {
            Some(func) => Some(func.typed::<(u32, u32), ()>(&store).map_err(|e| {
                GuestError::Instantiate(format!("`free` has the wrong signature: {e}"))
            })?),
            None => None,
        };

        Ok(Self {
            memory,
            malloc,
            free,
            encoding,
        })
    }

    /// The guest's linear memory.
    pub const fn memory(&self) -> Memory {
        self.memory
    }

    /// The configured string encoding.
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Whether the guest exports a `free` function.
    pub const fn can_free(&self) -> bool {
        self.free.is_some()
    }

    /// Copy `value` into guest memory as a NUL-terminated byte run.
    ///
    /// Exactly `len + 1` bytes are requested from the guest's `malloc`,
    /// where `len` is the encoded length of `value`. The caller owns the
    /// returned block.
    ///
    /// # Errors
    ///
    /// Fails if `value` cannot be encoded or contains a NUL, if `malloc`
    /// traps, or if the returned block lies outside linear memory.
    pub fn write_string(
        &self,
        mut store: impl AsContextMut,
        value: &str,
    ) -> Result<GuestAllocation, GuestError> {
        let mut bytes = self.encoding.encode(value)?;
        if let Some(position) = bytes.iter().position(|&b| b == 0) {
            return Err(GuestError::EmbeddedNul { position });
        }
        bytes.push(0);

        let size = u32::try_from(bytes.len()).map_err(|_| GuestError::Trap {
            function: "malloc",
            message: format!("{} bytes exceed the guest address space", bytes.len()),
        })?;
        let pointer = self
            .malloc
            .call(&mut store, size)
            .map_err(|e| trap("malloc", &e))?;

        self.memory
            .write(&mut store, pointer as usize, &bytes)
            .map_err(|_| GuestError::InvalidGuestPointer {
                pointer,
                reason: "allocation lies outside linear memory",
            })?;

        trace!(pointer, size, "wrote guest string");
        Ok(GuestAllocation { pointer, size })
    }

    /// Decode the `{ data_pointer, length }` record at `pointer`.
    ///
    /// # Errors
    ///
    /// Returns [`GuestError::InvalidGuestPointer`] if `pointer` is not
    /// 4-byte aligned or the record extends past the end of memory.
    pub fn read_record(
        &self,
        store: impl AsContext,
        pointer: u32,
    ) -> Result<GuestRecord, GuestError> {
        if pointer % 4 != 0 {
            return Err(GuestError::InvalidGuestPointer {
                pointer,
                reason: "string record is not 4-byte aligned",
            });
        }

        let mut record = [0u8; RECORD_SIZE];
        self.memory
            .read(&store, pointer as usize, &mut record)
            .map_err(|_| GuestError::InvalidGuestPointer {
                pointer,
                reason: "string record lies outside linear memory",
            })?;

        let [p0, p1, p2, p3, l0, l1, l2, l3] = record;
        Ok(GuestRecord {
            data_pointer: u32::from_le_bytes([p0, p1, p2, p3]),
            length: u32::from_le_bytes([l0, l1, l2, l3]),
        })
    }

    /// Read the string described by the record at `pointer`.
    ///
    /// # Errors
    ///
    /// Returns [`GuestError::InvalidGuestPointer`] when the record or the
    /// bytes it describes fall outside memory, and decoding errors from
    /// [`Encoding::decode`].
    pub fn read_string(&self, store: impl AsContext, pointer: u32) -> Result<String, GuestError> {
        let record = self.read_record(&store, pointer)?;

        let in_bounds = (record.data_pointer as usize)
            .checked_add(record.length as usize)
            .is_some_and(|end| end <= self.memory.data_size(&store));
        if !in_bounds {
            return Err(GuestError::InvalidGuestPointer {
                pointer: record.data_pointer,
                reason: "string data lies outside linear memory",
            });
        }

        let mut bytes = vec![0u8; record.length as usize];
        self.memory
            .read(&store, record.data_pointer as usize, &mut bytes)
            .map_err(|_| GuestError::InvalidGuestPointer {
                pointer: record.data_pointer,
                reason: "string data lies outside linear memory",
            })?;

        trace!(
            pointer,
            data_pointer = record.data_pointer,
            length = record.length,
            "read guest string"
        );
        self.encoding.decode(bytes)
    }

    /// Return `allocation` to the guest allocator.
    ///
    /// Returns `false` without doing anything when the guest exports no
    /// `free`.
    ///
    /// # Errors
    ///
    /// Returns [`GuestError::Trap`] if the guest's `free` traps.
    pub fn release(
        &self,
        store: impl AsContextMut,
        allocation: GuestAllocation,
    ) -> Result<bool, GuestError> {
        let Some(free) = &self.free else {
            return Ok(false);
        };
        free.call(store, (allocation.pointer, allocation.size))
            .map_err(|e| trap("free", &e))?;
        Ok(true)
    }
}

/// Flatten a wasmtime error into [`GuestError::Trap`].
pub(crate) fn trap(function: &'static str, error: &wasmtime::Error) -> GuestError {
    GuestError::Trap {
        function,
        message: format!("{error:#}"),
    }
}
