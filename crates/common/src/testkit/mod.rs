//! Test doubles for exercising the cache without a real server.
//!
//! `QueueBackend` plays the role of a server that answers with scripted
//! responses and blocks forever once the script runs out, which is exactly
//! what the timeout tiers need to be tested against.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::backend::{BackendError, SecretBackend};
use crate::clock::Clock;
use crate::secret::Secret;

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct MockClock {
    now: Arc<Mutex<SystemTime>>,
}

impl MockClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(SystemTime::now())
    }
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

/// Backend whose every request fails with a transient error.
#[derive(Debug, Default)]
pub struct FailingBackend;

#[async_trait]
impl SecretBackend for FailingBackend {
    async fn fetch_secret(&self, _name: &str) -> Result<Secret, BackendError> {
        Err(anyhow::anyhow!("injected failure").into())
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>, BackendError> {
        Err(anyhow::anyhow!("injected failure").into())
    }
}

/// Backend that reports every secret as deleted and lists nothing.
#[derive(Debug, Default)]
pub struct DeletedBackend;

#[async_trait]
impl SecretBackend for DeletedBackend {
    async fn fetch_secret(&self, _name: &str) -> Result<Secret, BackendError> {
        Err(BackendError::Deleted)
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>, BackendError> {
        Ok(Vec::new())
    }
}

/// Backend that answers from queued responses and hangs once they run out.
#[derive(Debug, Default)]
pub struct QueueBackend {
    secrets: Mutex<VecDeque<Secret>>,
    listings: Mutex<VecDeque<Vec<Secret>>>,
}

impl QueueBackend {
    pub fn push_secret(&self, secret: Secret) {
        self.secrets.lock().unwrap().push_back(secret);
    }

    pub fn push_listing(&self, listing: Vec<Secret>) {
        self.listings.lock().unwrap().push_back(listing);
    }
}

#[async_trait]
impl SecretBackend for QueueBackend {
    async fn fetch_secret(&self, _name: &str) -> Result<Secret, BackendError> {
        let next = self.secrets.lock().unwrap().pop_front();
        match next {
            Some(secret) => Ok(secret),
            None => std::future::pending().await,
        }
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>, BackendError> {
        let next = self.listings.lock().unwrap().pop_front();
        match next {
            Some(listing) => Ok(listing),
            None => std::future::pending().await,
        }
    }
}
