//! Shared fixtures for unit tests that need a live guest instance.

use std::sync::Arc;

use wasmtime::{Engine, Instance, Linker, Module, Store};

use crate::adapter::{self, HostState};
use crate::bridge::{Encoding, GuestBridge};
use crate::table::LookupTable;

/// Grants when the table maps `perm:<meetingId>` to `true`; exports `free`
/// and bookkeeping globals.
pub(crate) const MEETING_GUEST: &str = include_str!("../tests/fixtures/meeting_guest.wat");

/// Grants when the table maps the permission name itself to `true`.
pub(crate) const PERM_GUEST: &str = include_str!("../tests/fixtures/perm_guest.wat");

pub(crate) struct Fixture {
    pub(crate) store: Store<HostState>,
    pub(crate) instance: Instance,
    pub(crate) bridge: GuestBridge,
}

impl Fixture {
    pub(crate) fn new(encoding: Encoding) -> Self {
        Self::with_guest(MEETING_GUEST, LookupTable::default(), encoding)
    }

    pub(crate) fn with_guest(wat: &str, table: LookupTable, encoding: Encoding) -> Self {
        let engine = Engine::default();
        let module = Module::new(&engine, wat).expect("compile test guest");
        let mut linker = Linker::new(&engine);
        adapter::add_to_linker(&mut linker).expect("define getData");

        let mut store = Store::new(&engine, HostState::new(Arc::new(table), encoding));
        let instance = linker
            .instantiate(&mut store, &module)
            .expect("instantiate test guest");
        let bridge = GuestBridge::from_instance(&mut store, &instance, encoding).expect("bridge");

        Self {
            store,
            instance,
            bridge,
        }
    }

    pub(crate) fn global(&mut self, name: &str) -> i32 {
        self.instance
            .get_global(&mut self.store, name)
            .expect("exported global")
            .get(&mut self.store)
            .i32()
            .expect("i32 global")
    }

    pub(crate) fn bytes(&self, pointer: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.bridge
            .memory()
            .read(&self.store, pointer as usize, &mut buf)
            .expect("read guest memory");
        buf
    }

    /// Bytes up to (not including) the first NUL at `pointer`, as Latin-1
    /// or UTF-8 depending on the bridge encoding.
    pub(crate) fn c_string(&self, pointer: u32) -> String {
        let data = self.bridge.memory().data(&self.store);
        let start = pointer as usize;
        let end = data[start..]
            .iter()
            .position(|&b| b == 0)
            .map_or(data.len(), |n| start + n);
        self.bridge
            .encoding()
            .decode(data[start..end].to_vec())
            .expect("decode guest string")
    }

    pub(crate) fn poke(&mut self, pointer: u32, bytes: &[u8]) {
        self.bridge
            .memory()
            .write(&mut self.store, pointer as usize, bytes)
            .expect("write guest memory");
    }

    pub(crate) fn call_u32(&mut self, name: &str, arg: u32) -> wasmtime::Result<u32> {
        let func = self
            .instance
            .get_typed_func::<u32, u32>(&mut self.store, name)?;
        func.call(&mut self.store, arg)
    }
}
