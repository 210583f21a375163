// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::lease::{LeaseClient, LeaseError, Presence};
use crate::procs::{Runner, Signal};
use crate::{Error, ErrorKind};

/// Holds the leader lock for as long as the process runs
///
/// Rules:
///  - retries acquisition every retry interval until acquired or signalled
///  - ready only once the lock is held
///  - renews at half the TTL
///  - losing the lock is fatal, the group must stop
///  - releases the lock when signalled, a failed release is only logged
pub struct LockMaintainer {
    client: Arc<dyn LeaseClient>,
    key: String,
    presence: Presence,
    retry_interval: Duration,
    ttl: Duration,
}

impl LockMaintainer {
    pub fn new<K: Into<String>>(
        client: Arc<dyn LeaseClient>,
        key: K,
        presence: Presence,
        retry_interval: Duration,
        ttl: Duration,
    ) -> Result<Self, Error> {
        if ttl / 2 == Duration::ZERO {
            return Err(Error::config(format!("lock TTL {:?} is too short to renew", ttl)));
        }
        if retry_interval == Duration::ZERO {
            return Err(Error::config("lock retry interval must be greater than zero"));
        }

        Ok(Self {
            client,
            key: key.into(),
            presence,
            retry_interval,
            ttl,
        })
    }

    /// Always strictly less than the TTL
    pub fn renew_interval(&self) -> Duration {
        self.ttl / 2
    }

    fn owner(&self) -> &str {
        &self.presence.owner_id
    }

    fn ownership_lost(&self) -> Error {
        ErrorKind::OwnershipLost {
            key: self.key.clone(),
            owner: self.owner().to_string(),
        }
        .into()
    }

    /// Returns false if signalled before the lock was acquired
    async fn acquire(&self, signals: &mut mpsc::Receiver<Signal>) -> Result<bool, Error> {
        let value = self.presence.to_json()?;

        loop {
            // a signal drops an in-flight register, a backend that already took the
            // key keeps it until its own TTL runs out since release is never tried
            let attempt = tokio::select! {
                signal = signals.recv() => {
                    info!(received_signal = ?signal, "signalled-before-acquiring");
                    return Ok(false);
                }
                attempt = self.client.register(&self.key, self.owner(), &value, self.ttl) => attempt,
            };

            match attempt {
                Ok(()) => return Ok(true),
                Err(LeaseError::AlreadyHeld(_)) => {
                    debug!(retry_interval = ?self.retry_interval, "lock-held-elsewhere")
                }
                Err(err) => warn!(error = %err, "failed-to-acquire-lock"),
            }

            tokio::select! {
                signal = signals.recv() => {
                    info!(received_signal = ?signal, "signalled-before-acquiring");
                    return Ok(false);
                }
                _ = time::sleep(self.retry_interval) => (),
            }
        }
    }

    async fn release(&self) {
        match self.client.release(&self.key, self.owner()).await {
            Ok(()) => info!("released-lock"),
            Err(err) => error!(error = %err, "failed-to-release-lock"),
        }
    }
}

#[async_trait]
impl Runner for LockMaintainer {
    async fn run(
        &mut self,
        mut signals: mpsc::Receiver<Signal>,
        ready: oneshot::Sender<()>,
    ) -> Result<(), Error> {
        info!(key = %self.key, owner = %self.owner(), address = %self.presence.address, "acquiring-lock");
        if !self.acquire(&mut signals).await? {
            return Ok(());
        }

        info!(key = %self.key, "acquired-lock");
        ready.send(()).ok();

        let renew_interval = self.renew_interval();
        let mut renewals = time::interval_at(Instant::now() + renew_interval, renew_interval);
        renewals.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renewed_at = Instant::now();

        loop {
            tokio::select! {
                signal = signals.recv() => {
                    info!(received_signal = ?signal, "shutting-down");
                    self.release().await;
                    return Ok(());
                }
                _ = renewals.tick() => {
                    match self.client.refresh(&self.key, self.owner(), self.ttl).await {
                        Ok(()) => {
                            debug!("renewed-lock");
                            renewed_at = Instant::now();
                        }
                        Err(LeaseError::NotOwner(_)) => {
                            error!(key = %self.key, "lost-lock");
                            return Err(self.ownership_lost());
                        }
                        Err(err) => {
                            warn!(error = %err, "failed-to-renew-lock");
                            // without a renewal inside the TTL the backend may have handed the lock on
                            if renewed_at.elapsed() >= self.ttl {
                                error!(key = %self.key, "lock-expired");
                                return Err(self.ownership_lost());
                            }
                        }
                    }
                }
            }
        }
    }
}
