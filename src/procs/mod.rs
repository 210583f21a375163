// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod group;
mod lock;
mod sigmon;
mod worker;

pub use group::{GroupState, Member, OrderedGroup};
pub use lock::LockMaintainer;
pub use nix::sys::signal::Signal;
pub use sigmon::SignalMonitor;
pub use worker::Worker;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument};

use crate::Error;

/// Signals queued to a runner before it reads them
pub const SIGNAL_BUFFER: usize = 4;

/// A unit of work with a start, ready, stop lifecycle
///
/// `run` must send on `ready` once the runner is usable by whatever is started
/// after it, then keep running until a signal arrives on `signals`. A closed
/// `signals` channel means nobody can ask the runner to stop any more, and is
/// treated as a stop request.
///
/// [`SignalMonitor`] is the exception: its stop requests come from the OS, so it
/// keeps running after its `signals` channel closes and only stops the wrapped
/// runner on SIGINT or SIGTERM.
#[async_trait]
pub trait Runner: Send {
    async fn run(
        &mut self,
        signals: mpsc::Receiver<Signal>,
        ready: oneshot::Sender<()>,
    ) -> Result<(), Error>;
}

#[async_trait]
impl Runner for Box<dyn Runner> {
    async fn run(
        &mut self,
        signals: mpsc::Receiver<Signal>,
        ready: oneshot::Sender<()>,
    ) -> Result<(), Error> {
        (**self).run(signals, ready).await
    }
}

/// A runner executing on its own task
#[derive(Debug)]
pub struct Process {
    name: String,
    signals: mpsc::Sender<Signal>,
    handle: JoinHandle<Result<(), Error>>,
}

impl Process {
    /// Spawns `runner` and returns the handle along with its readiness notice
    pub fn spawn<R>(name: &str, runner: R) -> (Self, oneshot::Receiver<()>)
    where
        R: Runner + 'static,
    {
        let (signals, signals_rx) = mpsc::channel(SIGNAL_BUFFER);
        let (ready, ready_rx) = oneshot::channel();

        let mut runner = runner;
        let handle = tokio::spawn(
            async move { runner.run(signals_rx, ready).await }
                .instrument(info_span!("member", name = %name)),
        );

        let process = Self {
            name: name.to_string(),
            signals,
            handle,
        };
        (process, ready_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivers `signal`, returns false if the runner already exited or has a full queue
    pub fn signal(&self, signal: Signal) -> bool {
        self.signals.try_send(signal).is_ok()
    }

    /// Waits for the runner's terminal result
    pub async fn wait(mut self) -> Result<(), Error> {
        self.exited().await
    }

    /// Polls for the terminal result without consuming the handle, must not be called after it resolved
    pub(crate) async fn exited(&mut self) -> Result<(), Error> {
        (&mut self.handle).await?
    }

    pub(crate) fn abort(&self) {
        self.handle.abort();
    }
}

/// Starts `runner` and returns once it is ready or has already exited
///
/// If the runner exits before signalling readiness, `wait` on the returned
/// handle reports why.
pub async fn invoke<R>(name: &str, runner: R) -> Process
where
    R: Runner + 'static,
{
    let (process, ready) = Process::spawn(name, runner);
    // an Err means the ready sender was dropped, the runner is exiting
    ready.await.ok();
    process
}
