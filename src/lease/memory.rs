// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{LeaseClient, LeaseError};

#[derive(Debug)]
struct Entry {
    owner: String,
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// An in-process coordination service
///
/// Clones share the same registry, so two clones behave like two peers talking
/// to one compare-and-swap backend. Expiry follows the tokio clock, a paused
/// test runtime can step it forward.
#[derive(Clone, Debug, Default)]
pub struct MemoryLeaseClient {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryLeaseClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, LeaseError> {
        self.entries
            .lock()
            .map_err(|_| LeaseError::Unavailable("lease registry lock poisoned".to_string()))
    }

    /// Returns the live owner and value of `key`
    pub fn get(&self, key: &str) -> Option<(String, Vec<u8>)> {
        let now = Instant::now();
        let entries = self.entries().ok()?;

        entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| (entry.owner.clone(), entry.value.clone()))
    }

    /// Overwrites `key` regardless of the current owner, as a peer would after a partition
    pub fn steal(&self, key: &str, owner: &str, value: &[u8], ttl: Duration) {
        if let Ok(mut entries) = self.entries() {
            entries.insert(
                key.to_string(),
                Entry {
                    owner: owner.to_string(),
                    value: value.to_vec(),
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }
}

#[async_trait]
impl LeaseClient for MemoryLeaseClient {
    async fn register(
        &self,
        key: &str,
        owner: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), LeaseError> {
        let now = Instant::now();
        let mut entries = self.entries()?;

        if let Some(entry) = entries.get(key) {
            if entry.is_live(now) && entry.owner != owner {
                return Err(LeaseError::AlreadyHeld(key.to_string()));
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                owner: owner.to_string(),
                value: value.to_vec(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn refresh(&self, key: &str, owner: &str, ttl: Duration) -> Result<(), LeaseError> {
        let now = Instant::now();
        let mut entries = self.entries()?;

        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.owner == owner => {
                entry.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(LeaseError::NotOwner(key.to_string())),
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LeaseError> {
        let now = Instant::now();
        let mut entries = self.entries()?;

        match entries.get(key) {
            None => Ok(()),
            Some(entry) if !entry.is_live(now) || entry.owner == owner => {
                entries.remove(key);
                Ok(())
            }
            Some(_) => Err(LeaseError::NotOwner(key.to_string())),
        }
    }
}
