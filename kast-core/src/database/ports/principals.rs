//! Principal storage port.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Principal, PrincipalId};

/// API principals, looked up by the digest of their key.
#[async_trait]
pub trait PrincipalRepository: Send + Sync {
    /// Store a principal with the digest of its API key.
    async fn create(&self, principal: &Principal, api_key_hash: &str) -> Result<()>;

    /// Fetch a principal by id.
    async fn get(&self, id: PrincipalId) -> Result<Option<Principal>>;

    /// Active principal whose API key digest equals `api_key_hash`.
    async fn find_by_api_key_hash(&self, api_key_hash: &str) -> Result<Option<Principal>>;
}
