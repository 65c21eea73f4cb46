//! Guest module bootstrap and the `hasPerm` call.
//!
//! [`PermissionChecker`] compiles the guest once. Every query runs in a
//! fresh [`HostRuntime`] (store + instance), so guest heap growth never
//! outlives the query that caused it.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};
use wasmtime::{Engine, ExternType, Instance, Linker, Module, Store, TypedFunc};

use crate::adapter::{self, HostState};
use crate::bridge::{self, Encoding, GuestAllocation, GuestBridge};
use crate::error::GuestError;
use crate::evaluator::{PermissionEvaluator, PermissionQuery};
use crate::table::LookupTable;

/// Name of the guest's permission export.
pub const HAS_PERM: &str = "hasPerm";

/// Guest return value meaning "granted".
pub const GRANTED: i32 = 1;

/// A compiled guest module plus everything needed to instantiate it.
pub struct PermissionChecker {
    engine: Engine,
    module: Module,
    linker: Linker<HostState>,
    table: Arc<LookupTable>,
    encoding: Encoding,
}

impl PermissionChecker {
    /// Load a guest module from a file (`.wasm`, or `.wat` text).
    ///
    /// # Errors
    ///
    /// Returns [`GuestError::Load`] if the module cannot be read or
    /// compiled, and [`GuestError::MissingExport`] if it lacks part of the
    /// host ABI.
    pub fn from_file(
        path: &Path,
        table: LookupTable,
        encoding: Encoding,
    ) -> Result<Self, GuestError> {
        let engine = Engine::default();
        let module = Module::from_file(&engine, path)
            .map_err(|e| GuestError::Load(format!("{}: {e:#}", path.display())))?;
        debug!(path = %path.display(), "compiled guest module");
        Self::new(engine, module, table, encoding)
    }

    /// Load a guest module from raw bytes (binary or text format).
    ///
    /// # Errors
    ///
    /// Same as [`PermissionChecker::from_file`].
    pub fn from_bytes(
        bytes: &[u8],
        table: LookupTable,
        encoding: Encoding,
    ) -> Result<Self, GuestError> {
        let engine = Engine::default();
        let module =
            Module::new(&engine, bytes).map_err(|e| GuestError::Load(format!("{e:#}")))?;
        Self::new(engine, module, table, encoding)
    }

    fn new(
        engine: Engine,
        module: Module,
        table: LookupTable,
        encoding: Encoding,
    ) -> Result<Self, GuestError> {
        validate_exports(&module)?;

        let mut linker = Linker::new(&engine);
        adapter::add_to_linker(&mut linker)?;

        Ok(Self {
            engine,
            module,
            linker,
            table: Arc::new(table),
            encoding,
        })
    }

    /// The string encoding used for both directions.
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Create a fresh instance of the guest.
    ///
    /// # Errors
    ///
    /// Returns [`GuestError::Instantiate`] if linking or the guest's start
    /// function fails.
    pub fn instantiate(&self) -> Result<HostRuntime, GuestError> {
        let mut store = Store::new(
            &self.engine,
            HostState::new(Arc::clone(&self.table), self.encoding),
        );
        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| GuestError::Instantiate(format!("{e:#}")))?;

        let bridge = GuestBridge::from_instance(&mut store, &instance, self.encoding)?;
        let has_perm = instance
            .get_typed_func::<(i32, i32, u32), i32>(&mut store, HAS_PERM)
            .map_err(|e| GuestError::Instantiate(format!("`{HAS_PERM}`: {e:#}")))?;

        Ok(HostRuntime {
            store,
            instance,
            bridge,
            has_perm,
            arena: Vec::new(),
        })
    }

    /// Ask the guest whether `query` is granted, in a fresh instance.
    ///
    /// # Errors
    ///
    /// Propagates instantiation errors and the errors of
    /// [`HostRuntime::has_perm`].
    pub fn has_perm(&self, query: &PermissionQuery) -> Result<bool, GuestError> {
        self.instantiate()?.has_perm(query)
    }
}

impl PermissionEvaluator for PermissionChecker {
    fn evaluate(&self, query: &PermissionQuery) -> Result<bool, GuestError> {
        self.has_perm(query)
    }
}

/// One live guest instance and the host-owned blocks allocated in it.
pub struct HostRuntime {
    store: Store<HostState>,
    instance: Instance,
    bridge: GuestBridge,
    has_perm: TypedFunc<(i32, i32, u32), i32>,
    arena: Vec<GuestAllocation>,
}

impl HostRuntime {
    /// Copy `value` into guest memory and return its pointer.
    ///
    /// The block is owned by this runtime until [`HostRuntime::release_all`].
    ///
    /// # Errors
    ///
    /// See [`GuestBridge::write_string`].
    pub fn write_string(&mut self, value: &str) -> Result<u32, GuestError> {
        let allocation = self.bridge.write_string(&mut self.store, value)?;
        self.arena.push(allocation);
        Ok(allocation.pointer)
    }

    /// Read the string described by the record at `pointer`.
    ///
    /// # Errors
    ///
    /// See [`GuestBridge::read_string`].
    pub fn read_string(&self, pointer: u32) -> Result<String, GuestError> {
        self.bridge.read_string(&self.store, pointer)
    }

    /// Number of `getData` calls served by this instance.
    pub fn lookups(&self) -> usize {
        self.store.data().lookups()
    }

    /// The underlying guest instance.
    pub const fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Run the guest's `hasPerm` export for `query`.
    ///
    /// Only an exact return value of `1` means granted.
    ///
    /// # Errors
    ///
    /// Returns the typed error of a failing `getData` callback when the
    /// guest trapped because of it, [`GuestError::Trap`] for any other guest
    /// failure, and errors from writing the permission string. The arena is
    /// released even when the call fails; the call's error wins over a
    /// failing `free`.
    pub fn has_perm(&mut self, query: &PermissionQuery) -> Result<bool, GuestError> {
        let perm_pointer = self.write_string(&query.permission)?;

        let outcome = self
            .has_perm
            .call(
                &mut self.store,
                (query.user_id, query.meeting_id, perm_pointer),
            )
            .map_err(|e| call_error(HAS_PERM, e));
        let released = self.release_all();

        let code = outcome?;
        let released = released?;
        debug!(
            user_id = query.user_id,
            meeting_id = query.meeting_id,
            permission = %query.permission,
            code,
            lookups = self.lookups(),
            released,
            "hasPerm returned"
        );

        if code != GRANTED && code != 0 {
            warn!(code, "guest returned a value other than 0 or 1; treating as denied");
        }
        Ok(code == GRANTED)
    }

    /// Free every host-owned block through the guest's `free` export.
    ///
    /// Returns how many blocks were freed. Without a `free` export the
    /// blocks are dropped from the arena and live until the instance dies.
    ///
    /// # Errors
    ///
    /// Returns [`GuestError::Trap`] if the guest's `free` traps.
    pub fn release_all(&mut self) -> Result<usize, GuestError> {
        if !self.bridge.can_free() {
            debug!(
                blocks = self.arena.len(),
                "guest exports no free; blocks live until the instance is dropped"
            );
            self.arena.clear();
            return Ok(0);
        }

        let mut released = 0;
        for allocation in self.arena.drain(..) {
            self.bridge.release(&mut self.store, allocation)?;
            released += 1;
        }
        Ok(released)
    }
}

/// Check the export surface before any instance is created.
fn validate_exports(module: &Module) -> Result<(), GuestError> {
    let mut has_memory = false;
    let mut has_malloc = false;
    let mut has_perm = false;
    for export in module.exports() {
        match (export.name(), export.ty()) {
            ("memory", ExternType::Memory(_)) => has_memory = true,
            ("malloc", ExternType::Func(_)) => has_malloc = true,
            (HAS_PERM, ExternType::Func(_)) => has_perm = true,
            _ => {}
        }
    }

    if !has_memory {
        return Err(GuestError::MissingExport {
            name: "memory",
            kind: "memory",
        });
    }
    if !has_malloc {
        return Err(GuestError::MissingExport {
            name: "malloc",
            kind: "func",
        });
    }
    if !has_perm {
        return Err(GuestError::MissingExport {
            name: HAS_PERM,
            kind: "func",
        });
    }
    Ok(())
}

/// Recover the host callback's own error from a trap, if it caused one.
fn call_error(function: &'static str, error: wasmtime::Error) -> GuestError {
    match error.downcast::<GuestError>() {
        Ok(err) => err,
        Err(other) => bridge::trap(function, &other),
    }
}
