//! Role checks for owner, admin and member actions.

use std::sync::Arc;

use tracing::warn;

use crate::feedback::error::{BotError, Denial, StorageError};
use crate::feedback::store::EventStore;
use crate::feedback::transport::Transport;

/// Role required by an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The single fixed owner. Valid in any group, authorized or not.
    Owner,
    /// Group admin (or the owner) in an authorized group.
    Admin,
    /// Anyone in an authorized group.
    Member,
}

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    Denied(Denial),
}

impl Decision {
    pub fn into_result(self) -> Result<(), BotError> {
        match self {
            Self::Granted => Ok(()),
            Self::Denied(denial) => Err(BotError::PermissionDenied(denial)),
        }
    }
}

/// Decides whether an actor may act in a group.
pub struct AuthorizationGate {
    owner_id: i64,
    store: Arc<EventStore>,
    transport: Arc<dyn Transport>,
}

impl AuthorizationGate {
    pub fn new(owner_id: i64, store: Arc<EventStore>, transport: Arc<dyn Transport>) -> Self {
        Self { owner_id, store, transport }
    }

    pub fn is_owner(&self, actor_id: i64) -> bool {
        actor_id == self.owner_id
    }

    /// Evaluate a role requirement, keeping the reason for a denial.
    pub async fn evaluate(
        &self,
        actor_id: i64,
        group_id: i64,
        role: Role,
    ) -> Result<Decision, StorageError> {
        if role == Role::Owner {
            return Ok(if self.is_owner(actor_id) {
                Decision::Granted
            } else {
                Decision::Denied(Denial::InsufficientRole)
            });
        }

        if !self.store.is_authorized(group_id)? {
            return Ok(Decision::Denied(Denial::GroupNotAuthorized));
        }

        if role == Role::Member || self.is_owner(actor_id) {
            return Ok(Decision::Granted);
        }

        let is_admin = match self.transport.is_group_admin(group_id, actor_id).await {
            Ok(is_admin) => is_admin,
            Err(e) => {
                warn!("Admin check failed for user {} in {}: {}", actor_id, group_id, e);
                false
            }
        };

        Ok(if is_admin {
            Decision::Granted
        } else {
            Decision::Denied(Denial::InsufficientRole)
        })
    }

    /// Plain yes/no form of [`evaluate`](Self::evaluate).
    pub async fn authorize(
        &self,
        actor_id: i64,
        group_id: i64,
        role: Role,
    ) -> Result<bool, StorageError> {
        Ok(self.evaluate(actor_id, group_id, role).await? == Decision::Granted)
    }

    /// Like [`evaluate`](Self::evaluate) but as a `BotResult` for `?` in handlers.
    pub async fn require(&self, actor_id: i64, group_id: i64, role: Role) -> Result<(), BotError> {
        self.evaluate(actor_id, group_id, role).await?.into_result()
    }
}
