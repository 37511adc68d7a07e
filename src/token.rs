//! Identity token generation
//!
//! The chain treats the token generator as an opaque collaborator that
//! returns a credential plus its expiry. Closures implement
//! [`TokenGenerator`] directly.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::error::ChainError;

/// Issued credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Opaque token value
    pub value: String,
    /// Expiry time
    pub expires: SystemTime,
}

impl Token {
    /// Check if the token is still valid at `now`
    #[must_use]
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        !self.value.is_empty() && self.expires > now
    }
}

/// Token generator collaborator
pub trait TokenGenerator: Send + Sync {
    /// Issue a token
    ///
    /// # Errors
    ///
    /// Returns `ChainError::Unauthorized` if no credential can be issued.
    fn generate(&self) -> Result<Token, ChainError>;
}

impl<F> TokenGenerator for F
where
    F: Fn() -> Result<Token, ChainError> + Send + Sync,
{
    fn generate(&self) -> Result<Token, ChainError> {
        self()
    }
}

/// Shared token generator handle
pub type SharedTokenGenerator = Arc<dyn TokenGenerator>;

/// Generator issuing random opaque tokens valid for `lifetime`
#[must_use]
pub fn random_generator(lifetime: Duration) -> SharedTokenGenerator {
    Arc::new(move || {
        let bytes: [u8; 24] = rand::random();
        Ok(Token {
            value: URL_SAFE_NO_PAD.encode(bytes),
            expires: SystemTime::now() + lifetime,
        })
    })
}
