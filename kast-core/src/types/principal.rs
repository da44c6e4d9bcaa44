//! API principals and roles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::PrincipalId;
use crate::error::ScanError;

/// What a principal may do across jobs it does not own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalRole {
    /// Edit access to every job.
    Admin,
    /// Access to owned and shared jobs only.
    User,
}

impl PrincipalRole {
    /// Lowercase name used in storage and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalRole::Admin => "admin",
            PrincipalRole::User => "user",
        }
    }
}

impl fmt::Display for PrincipalRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrincipalRole {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(PrincipalRole::Admin),
            "user" => Ok(PrincipalRole::User),
            other => Err(ScanError::InvalidInput(format!("unknown role '{other}'"))),
        }
    }
}

/// An authenticated API caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Principal id.
    pub id: PrincipalId,
    /// Unique.
    pub username: String,
    /// Role.
    pub role: PrincipalRole,
    /// Inactive principals cannot authenticate.
    pub is_active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Principal {
    /// An active principal with a fresh id.
    pub fn new(username: impl Into<String>, role: PrincipalRole) -> Self {
        Self {
            id: PrincipalId::new(),
            username: username.into(),
            role,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Admin role and still active.
    pub fn is_admin(&self) -> bool {
        self.is_active && self.role == PrincipalRole::Admin
    }
}
