// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::info;

use crate::procs::{Runner, Signal};
use crate::Error;

/// Periodic background work, run once the lock is held
///
/// Rules:
///  - ready as soon as it starts
///  - does one unit of work per tick
///  - exits at the first signal, never later than one tick after it
#[derive(Debug)]
pub struct Worker {
    interval: Duration,
    counter: u64,
}

impl Worker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            counter: 0,
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn tick(&mut self) {
        self.counter += 1;
        info!(counter = self.counter, "value");
    }
}

#[async_trait]
impl Runner for Worker {
    async fn run(
        &mut self,
        mut signals: mpsc::Receiver<Signal>,
        ready: oneshot::Sender<()>,
    ) -> Result<(), Error> {
        info!("starting");
        ready.send(()).ok();

        let mut ticks = time::interval_at(Instant::now() + self.interval, self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                signal = signals.recv() => {
                    info!(received_signal = ?signal, counter = self.counter, "shutting-down");
                    return Ok(());
                }
                _ = ticks.tick() => self.tick(),
            }
        }
    }
}
