//! Shared test helpers for integration tests.

#![allow(dead_code)]

use axum::Router;
use skybridge::gateway::{build_router, AppState, GatewayConfig};
use skybridge::queue::MemoryQueue;
use skybridge::signer::{SignError, StorageSigner};
use skybridge::store::memory::MemoryJobStore;
use std::sync::Arc;
use std::time::Duration;

/// Signer producing stable stub URLs; never talks to a real store.
pub struct StubSigner;

impl StorageSigner for StubSigner {
    fn signed_download(&self, bucket: &str, key: &str, _ttl: Duration) -> Result<String, SignError> {
        Ok(format!("http://stub-store/{}/{}?sig=get", bucket, key))
    }

    fn signed_upload(&self, bucket: &str, key: &str, _ttl: Duration) -> Result<String, SignError> {
        Ok(format!("http://stub-store/{}/{}?sig=put", bucket, key))
    }
}

/// Fresh gateway state on in-memory backends.
pub fn build_test_state() -> Arc<AppState> {
    AppState::new(
        Arc::new(MemoryJobStore::new()),
        Arc::new(MemoryQueue::new()),
        Arc::new(StubSigner),
        GatewayConfig::default(),
    )
}

/// Fresh test router plus a handle to the state behind it.
pub fn build_test_app() -> (Arc<AppState>, Router) {
    let state = build_test_state();
    let app = build_router(Arc::clone(&state));
    (state, app)
}
