//! Host side of a WebAssembly permission check.
//!
//! `permbridge-host` loads a guest module that implements a permission
//! policy, provides it with the `app.getData` lookup callback, and asks it
//! `hasPerm(userId, meetingId, permission)`.
//!
//! The pieces, bottom-up:
//! 1. **Table**: the read-only JSON document behind `getData`
//! 2. **Bridge**: string marshaling across guest linear memory
//! 3. **Adapter**: the `app.getData` host callback
//! 4. **Runtime**: module bootstrap, per-query instances, `hasPerm`

pub mod adapter;
pub mod bridge;
pub mod error;
pub mod evaluator;
pub mod runtime;
pub mod table;

#[cfg(test)]
mod testing;

// Re-export primary types for convenience.
pub use bridge::{Encoding, GuestAllocation, GuestBridge};
pub use error::GuestError;
pub use evaluator::{PermissionEvaluator, PermissionQuery};
pub use runtime::{HostRuntime, PermissionChecker};
pub use table::LookupTable;
