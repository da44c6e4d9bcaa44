//! Who may see or change a scan.

/// Keyed token digests and random token generation
pub mod crypto;
/// Access levels and the checks every read and write goes through
pub mod resolver;
/// Per-principal grants and public links
pub mod shares;

pub use crypto::TokenHasher;
pub use resolver::{AccessLevel, AccessResolver, resolve_access};
pub use shares::{CreatedLink, ShareService};

use std::fmt;

use crate::types::{AuditOrigin, Principal, PrincipalId};

/// The identity behind one request: an authenticated principal, a public
/// link token, both or neither.
#[derive(Clone, Default)]
pub struct Caller {
    /// Set when the request carried a valid API key.
    pub principal: Option<Principal>,
    /// Raw public-link token, if one was presented.
    pub share_token: Option<String>,
    /// Client address and user agent for audit records.
    pub origin: AuditOrigin,
}

impl fmt::Debug for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caller")
            .field("principal", &self.principal.as_ref().map(|p| p.id))
            .field("share_token", &self.share_token.as_ref().map(|_| "<redacted>"))
            .field("origin", &self.origin)
            .finish()
    }
}

impl Caller {
    /// An authenticated caller.
    pub fn principal(principal: Principal) -> Self {
        Self {
            principal: Some(principal),
            ..Self::default()
        }
    }

    /// A caller without an API key, optionally holding a link token.
    pub fn anonymous(share_token: Option<String>) -> Self {
        Self {
            share_token,
            ..Self::default()
        }
    }

    /// Attach the request's origin for audit records.
    pub fn with_origin(mut self, origin: AuditOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// `None` for anonymous callers.
    pub fn principal_id(&self) -> Option<PrincipalId> {
        self.principal.as_ref().map(|p| p.id)
    }

    /// True only for active admins.
    pub fn is_admin(&self) -> bool {
        self.principal.as_ref().is_some_and(Principal::is_admin)
    }
}
