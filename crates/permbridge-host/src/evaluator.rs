//! The narrow interface callers use to ask a permission question.

use serde::Serialize;

use crate::error::GuestError;

/// One permission question: may `user_id` use `permission` in `meeting_id`?
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionQuery {
    /// The user asking.
    pub user_id: i32,
    /// The meeting the permission applies to.
    pub meeting_id: i32,
    /// Permission name, passed to the guest verbatim.
    pub permission: String,
}

impl PermissionQuery {
    /// Build a query.
    pub fn new(user_id: i32, meeting_id: i32, permission: impl Into<String>) -> Self {
        Self {
            user_id,
            meeting_id,
            permission: permission.into(),
        }
    }
}

/// Something that can answer a [`PermissionQuery`].
///
/// The policy itself is opaque to the host; implementations only supply
/// the data lookups the policy asks for.
pub trait PermissionEvaluator {
    /// Answer `query`.
    ///
    /// # Errors
    ///
    /// Returns a [`GuestError`] if the evaluation could not be carried out.
    /// A denied permission is `Ok(false)`, not an error.
    fn evaluate(&self, query: &PermissionQuery) -> Result<bool, GuestError>;
}
