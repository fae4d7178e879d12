use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::common::error::{LeaseError, StoreError};
use crate::infrastructure::store::QueueBackend;

/// Proof of exclusive ownership of `key` while the store keeps it alive.
#[derive(Debug)]
pub struct Lease {
    key: String,
    token: String,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Clone)]
pub struct LeaseManager {
    backend: Arc<dyn QueueBackend>,
}

impl LeaseManager {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// `Ok(None)` means someone else holds a live lease on `key`.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
        let token = Uuid::new_v4().to_string();
        if !self.backend.set_if_absent(key, &token, ttl).await? {
            debug!(key, "lease already held");
            return Ok(None);
        }
        Ok(Some(Lease {
            key: key.to_string(),
            token,
        }))
    }

    pub async fn refresh(&self, lease: &Lease, ttl: Duration) -> Result<(), LeaseError> {
        if !self.backend.extend_if_owner(&lease.key, &lease.token, ttl).await? {
            return Err(LeaseError::Lost {
                key: lease.key.clone(),
            });
        }
        Ok(())
    }

    pub async fn release(&self, lease: Lease) -> Result<(), LeaseError> {
        if !self.backend.delete_if_owner(&lease.key, &lease.token).await? {
            return Err(LeaseError::Lost { key: lease.key });
        }
        Ok(())
    }
}
