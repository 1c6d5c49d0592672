//! # Signer — Short-Lived Object-Store URLs
//!
//! Job payloads never cross the gateway; agents fetch inputs and push
//! outputs directly against the object store using pre-authorized URLs the
//! dispatcher mints at assignment time. The URLs must support a bare HTTP
//! GET / PUT with no extra signing headers.
//!
//! The bundled [`HmacSigner`] targets any object endpoint that accepts its
//! query-parameter scheme (the development object server does; production
//! deployments plug in their store's native presigner behind the
//! [`StorageSigner`] trait).
//!
//! ## URL stability
//!
//! Expiry is quantized to the signing TTL window, so repeated signings of
//! the same object within one window produce byte-identical URLs. The
//! agent-side input cache is keyed by URL string and relies on this.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default lifetime of a signed URL.
pub const DEFAULT_SIGNING_TTL: Duration = Duration::from_secs(15 * 60);

pub type SharedSigner = Arc<dyn StorageSigner>;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("signing failed: {0}")]
    Failed(String),
}

pub trait StorageSigner: Send + Sync {
    /// A URL supporting a bare HTTP GET of `(bucket, key)` for `ttl`.
    fn signed_download(&self, bucket: &str, key: &str, ttl: Duration)
        -> Result<String, SignError>;

    /// A URL supporting a bare HTTP PUT of `(bucket, key)` for `ttl`.
    fn signed_upload(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, SignError>;
}

/// Query-parameter presigner: SHA-256 over the secret and the canonical
/// request, base64url-encoded into `sb-signature`.
pub struct HmacSigner {
    endpoint: String,
    secret: String,
}

impl HmacSigner {
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> Self {
        let endpoint: String = endpoint.into();
        HmacSigner {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }

    /// Window-quantized expiry: stable within a TTL window, always at
    /// least one full TTL in the future.
    fn expiry(ttl: Duration) -> u64 {
        let window = ttl.as_secs().max(1);
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        (now / window + 2) * window
    }

    fn signature(&self, method: &str, bucket: &str, key: &str, expires: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"\n");
        hasher.update(method.as_bytes());
        hasher.update(b"\n");
        hasher.update(bucket.as_bytes());
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires.to_string().as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    fn sign(&self, method: &str, bucket: &str, key: &str, ttl: Duration)
        -> Result<String, SignError> {
        if bucket.is_empty() || key.is_empty() {
            return Err(SignError::Failed(format!(
                "bucket and key are required (bucket={:?}, key={:?})",
                bucket, key
            )));
        }
        let expires = Self::expiry(ttl);
        let sig = self.signature(method, bucket, key, expires);
        let encoded_key: String = key
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!(
            "{}/{}/{}?sb-expires={}&sb-signature={}",
            self.endpoint,
            urlencoding::encode(bucket),
            encoded_key,
            expires,
            sig
        ))
    }

    /// Validate a presented signature, for object servers colocated with
    /// the gateway (and for tests).
    pub fn verify(&self, method: &str, bucket: &str, key: &str, expires: u64, sig: &str) -> bool {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        expires > now && self.signature(method, bucket, key, expires) == sig
    }
}

impl StorageSigner for HmacSigner {
    fn signed_download(&self, bucket: &str, key: &str, ttl: Duration)
        -> Result<String, SignError> {
        self.sign("GET", bucket, key, ttl)
    }

    fn signed_upload(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, SignError> {
        self.sign("PUT", bucket, key, ttl)
    }
}
