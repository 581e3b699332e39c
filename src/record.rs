//! Provisioned-container records and their lifecycle states.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a provisioned container.
///
/// `Provisioning -> Running -> Expiring | Deleting -> Deleted`. `Deleting` is
/// the lock held by whichever caller won the right to tear the container
/// down. A winner whose teardown fails releases the lock to `Expiring`, never
/// back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Provisioning,
    Running,
    Expiring,
    Deleting,
    Deleted,
}

impl ContainerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerState::Provisioning => "provisioning",
            ContainerState::Running => "running",
            ContainerState::Expiring => "expiring",
            ContainerState::Deleting => "deleting",
            ContainerState::Deleted => "deleted",
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Provisioning, Running)
                | (Provisioning, Deleted)
                | (Running, Expiring)
                | (Running, Deleting)
                | (Expiring, Deleting)
                | (Deleting, Expiring)
                | (Deleting, Deleted)
        )
    }

    /// States from which a deletion may be claimed.
    pub fn is_deletable(self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Expiring)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ContainerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(ContainerState::Provisioning),
            "running" => Ok(ContainerState::Running),
            "expiring" => Ok(ContainerState::Expiring),
            "deleting" => Ok(ContainerState::Deleting),
            "deleted" => Ok(ContainerState::Deleted),
            other => Err(format!("unknown container state '{}'", other)),
        }
    }
}

/// One provisioned container as tracked by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ports: Vec<u16>,
    pub state: ContainerState,
}

impl ContainerRecord {
    /// A freshly started container. `expires_at` is fixed at `created_at + ttl`.
    pub fn running(
        id: impl Into<String>,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
        ports: Vec<u16>,
    ) -> Self {
        Self {
            id: id.into(),
            created_at,
            expires_at: created_at + ttl,
            ports,
            state: ContainerState::Running,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time left until expiry, zero once past.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}
