//! The `app.getData` host callback.
//!
//! The guest passes a pointer to a `{ ptr, len }` key record; the host
//! answers with a pointer to a freshly allocated NUL-terminated JSON text.
//! Ownership of that block passes to the guest. Under Latin-1 the JSON text
//! is pure ASCII, with other characters written as `\uXXXX` escapes.

use std::sync::Arc;

use tracing::debug;
use wasmtime::{Caller, Linker};

use crate::bridge::{Encoding, GuestBridge};
use crate::error::GuestError;
use crate::table::LookupTable;

/// Import module name the guest expects host functions under.
pub const IMPORT_MODULE: &str = "app";

/// Import name of the lookup callback.
pub const GET_DATA: &str = "getData";

/// Per-store state visible to host callbacks.
#[derive(Debug, Clone)]
pub struct HostState {
    table: Arc<LookupTable>,
    encoding: Encoding,
    lookups: usize,
}

impl HostState {
    /// Create callback state over a shared lookup table.
    pub const fn new(table: Arc<LookupTable>, encoding: Encoding) -> Self {
        Self {
            table,
            encoding,
            lookups: 0,
        }
    }

    /// The table answering `getData`.
    pub fn table(&self) -> &LookupTable {
        &self.table
    }

    /// The string encoding shared with the guest.
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// How many `getData` calls this store has served.
    pub const fn lookups(&self) -> usize {
        self.lookups
    }
}

/// Register `app.getData` with `linker`.
///
/// # Errors
///
/// Returns [`GuestError::Instantiate`] if the name is already defined.
pub fn add_to_linker(linker: &mut Linker<HostState>) -> Result<(), GuestError> {
    linker
        .func_wrap(
            IMPORT_MODULE,
            GET_DATA,
            |mut caller: Caller<'_, HostState>, key_pointer: u32| -> wasmtime::Result<u32> {
                Ok(get_data(&mut caller, key_pointer)?)
            },
        )
        .map_err(|e| {
            GuestError::Instantiate(format!("failed to define {IMPORT_MODULE}.{GET_DATA}: {e}"))
        })?;
    Ok(())
}

/// Resolve the key record at `key_pointer` and write the JSON answer into
/// guest memory, returning its pointer.
///
/// Absent keys answer `null`; that is never an error.
///
/// # Errors
///
/// Fails on an invalid key record, an unencodable answer, or a guest
/// allocator failure. The error traps the calling guest.
pub fn get_data(caller: &mut Caller<'_, HostState>, key_pointer: u32) -> Result<u32, GuestError> {
    let encoding = caller.data().encoding;
    let bridge = GuestBridge::from_caller(caller, encoding)?;
    let key = bridge.read_string(&*caller, key_pointer)?;

    let state = caller.data();
    let hit = state.table.get(&key).is_some();
    let value = match encoding {
        Encoding::Latin1 => state.table.lookup_ascii_json(&key)?,
        Encoding::Utf8 => state.table.lookup_json(&key),
    };
    debug!(key = %key, hit, "getData");

    let allocation = bridge.write_string(&mut *caller, &value)?;
    caller.data_mut().lookups += 1;
    Ok(allocation.pointer)
}
