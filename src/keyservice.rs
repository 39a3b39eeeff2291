//! Key service seam (spec.md §6): user name to public key / endpoint
//! lookup. The directory server consults it only indirectly, through the
//! packing engine and the access evaluator's wildcard/domain matching; no
//! directory operation calls it directly, so this module documents the
//! interface without wiring it into [`crate::store`].

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub network: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct PublicKey(pub Vec<u8>);

#[derive(Debug, Clone)]
pub struct UserLookup {
    pub dir_endpoints: Vec<Endpoint>,
    pub store_endpoints: Vec<Endpoint>,
    pub public_key: PublicKey,
}

#[derive(Debug, Error)]
pub enum KeyServiceError {
    #[error("user not found")]
    NotFound,
    #[error("key service io error: {0}")]
    Io(String),
}

#[async_trait]
pub trait KeyService: Send + Sync {
    async fn lookup(&self, user: &str) -> Result<UserLookup, KeyServiceError>;

    async fn put(&self, user: &str, lookup: UserLookup) -> Result<(), KeyServiceError>;
}

/// A key service returning a fixed answer for every lookup, useful for
/// tests and the demonstration binary where no real key service is wired
/// up.
#[derive(Debug, Clone)]
pub struct StaticKeyService {
    answer: UserLookup,
}

impl StaticKeyService {
    pub fn new(answer: UserLookup) -> Self {
        Self { answer }
    }
}

#[async_trait]
impl KeyService for StaticKeyService {
    async fn lookup(&self, _user: &str) -> Result<UserLookup, KeyServiceError> {
        Ok(self.answer.clone())
    }

    async fn put(&self, _user: &str, _lookup: UserLookup) -> Result<(), KeyServiceError> {
        Ok(())
    }
}
