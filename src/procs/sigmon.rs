// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use async_trait::async_trait;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::procs::{Runner, Signal, SIGNAL_BUFFER};
use crate::Error;

/// Turns SIGINT and SIGTERM into a stop request for the wrapped runner
///
/// Rules:
///  - the first signal, from the OS or from whoever runs the monitor, is forwarded
///  - later signals are dropped, the runner is never killed
///  - the wrapped runner's result is the monitor's result
///  - a closed parent channel is not a stop request, the OS signals still are
pub struct SignalMonitor<R> {
    runner: R,
}

impl<R: Runner> SignalMonitor<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub fn into_inner(self) -> R {
        self.runner
    }
}

#[async_trait]
impl<R: Runner> Runner for SignalMonitor<R> {
    async fn run(
        &mut self,
        mut signals: mpsc::Receiver<Signal>,
        ready: oneshot::Sender<()>,
    ) -> Result<(), Error> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        let (forward, forward_rx) = mpsc::channel(SIGNAL_BUFFER);
        // the monitor is ready when the runner is
        let inner = self.runner.run(forward_rx, ready);
        tokio::pin!(inner);

        let mut forwarded = false;
        let mut parent_open = true;

        loop {
            let received = tokio::select! {
                result = &mut inner => return result,
                _ = interrupt.recv(), if !forwarded => Some(Signal::SIGINT),
                _ = terminate.recv(), if !forwarded => Some(Signal::SIGTERM),
                signal = signals.recv(), if !forwarded && parent_open => signal,
            };

            match received {
                Some(signal) => {
                    info!(?signal, "forwarding-signal");
                    forward.try_send(signal).ok();
                    forwarded = true;
                }
                None => {
                    debug!("signal channel closed, watching process signals only");
                    parent_open = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procs::{invoke, Process, Worker};
    use std::time::Duration;

    struct Counting {
        signals_seen: std::sync::Arc<std::sync::atomic::AtomicUsize>,
        linger: Duration,
    }

    #[async_trait]
    impl Runner for Counting {
        async fn run(
            &mut self,
            mut signals: mpsc::Receiver<Signal>,
            ready: oneshot::Sender<()>,
        ) -> Result<(), Error> {
            ready.send(()).ok();
            signals.recv().await;
            self.signals_seen
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

            // anything forwarded while lingering would be counted here
            let deadline = tokio::time::sleep(self.linger);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => return Ok(()),
                    extra = signals.recv() => match extra {
                        Some(_) => {
                            self.signals_seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                        None => return Ok(()),
                    },
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_exactly_once() {
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let monitor = SignalMonitor::new(Counting {
            signals_seen: seen.clone(),
            linger: Duration::from_secs(1),
        });

        let process = invoke("monitor", monitor).await;
        assert!(process.signal(Signal::SIGTERM));
        assert!(process.signal(Signal::SIGINT));

        process.wait().await.expect("clean exit");
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    struct Failing;

    #[async_trait]
    impl Runner for Failing {
        async fn run(
            &mut self,
            _signals: mpsc::Receiver<Signal>,
            ready: oneshot::Sender<()>,
        ) -> Result<(), Error> {
            ready.send(()).ok();
            Err(Error::from("worker failed"))
        }
    }

    #[tokio::test]
    async fn test_propagates_runner_exit() {
        let process = invoke("monitor", SignalMonitor::new(Failing)).await;
        let err = process.wait().await.err().expect("failure propagated");
        assert_eq!(err.to_string(), "an error occured: worker failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_parent_signal_to_inner_runner() {
        let mut monitor = SignalMonitor::new(Worker::new(Duration::from_secs(5)));
        let (signals, signals_rx) = mpsc::channel(1);
        let (ready, _ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            signals.send(Signal::SIGTERM).await.ok();
        });

        monitor.run(signals_rx, ready).await.expect("clean exit");
        assert_eq!(monitor.into_inner().counter(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_parent_channel_keeps_running() {
        let mut monitor = SignalMonitor::new(Worker::new(Duration::from_secs(5)));
        let (signals, signals_rx) = mpsc::channel(1);
        let (ready, _ready_rx) = oneshot::channel();
        drop(signals);

        let outcome =
            tokio::time::timeout(Duration::from_secs(32), monitor.run(signals_rx, ready)).await;
        assert!(outcome.is_err(), "monitor must outlive its parent channel");
        assert_eq!(monitor.into_inner().counter(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_follows_runner() {
        let (process, ready) =
            Process::spawn("monitor", SignalMonitor::new(Worker::new(Duration::from_secs(5))));
        ready.await.expect("ready");

        assert!(process.signal(Signal::SIGINT));
        process.wait().await.expect("clean exit");
    }
}
