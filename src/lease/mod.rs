// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Clients for the coordination service that backs the leader lock

mod consul;
mod memory;
mod presence;

pub use consul::ConsulLeaseClient;
pub use memory::MemoryLeaseClient;
pub use presence::Presence;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("lock {0} is already held by another owner")]
    AlreadyHeld(String),
    #[error("lock {0} is not owned by this instance")]
    NotOwner(String),
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected response from coordination service: {0}")]
    Protocol(String),
}

/// A TTL bounded, compare-and-swap key registry
///
/// Every operation names the owner, implementations must never let one owner
/// refresh or release a key registered by another.
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Registers `key` for `owner` with `value`, expiring after `ttl` unless refreshed
    ///
    /// Fails with [`LeaseError::AlreadyHeld`] while another owner holds an unexpired registration.
    async fn register(
        &self,
        key: &str,
        owner: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), LeaseError>;

    /// Extends the registration of `key` by `ttl`
    ///
    /// Fails with [`LeaseError::NotOwner`] if the key expired or changed hands.
    async fn refresh(&self, key: &str, owner: &str, ttl: Duration) -> Result<(), LeaseError>;

    /// Removes the registration, best-effort
    async fn release(&self, key: &str, owner: &str) -> Result<(), LeaseError>;
}

#[async_trait]
impl<C: LeaseClient + ?Sized> LeaseClient for Arc<C> {
    async fn register(
        &self,
        key: &str,
        owner: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), LeaseError> {
        (**self).register(key, owner, value, ttl).await
    }

    async fn refresh(&self, key: &str, owner: &str, ttl: Duration) -> Result<(), LeaseError> {
        (**self).refresh(key, owner, ttl).await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LeaseError> {
        (**self).release(key, owner).await
    }
}
