#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

use lockstep::lease::{LeaseClient, LeaseError, MemoryLeaseClient, Presence};
use lockstep::procs::{Runner, Signal};
use lockstep::Error;

pub const KEY: &str = "v1/locks/lockstep_lock";

pub type Events = Arc<Mutex<Vec<String>>>;

pub fn events() -> Events {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn record(events: &Events, event: String) {
    events.lock().expect("events poisoned").push(event);
}

pub fn snapshot(events: &Events) -> Vec<String> {
    events.lock().expect("events poisoned").clone()
}

pub fn position(events: &[String], event: &str) -> usize {
    events
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("{} not in {:?}", event, events))
}

pub fn presence(owner: &str) -> Presence {
    Presence::new(owner, format!("http://10.0.0.1:9016/{}", owner))
}

/// What a [`Scripted`] runner does over its life
#[derive(Clone, Copy, Debug)]
pub enum Script {
    /// ready at once, exits cleanly when signalled
    Normal,
    /// ready after a delay, exits cleanly if signalled first
    ReadyAfter(Duration),
    /// ready at once, fails after a delay unless signalled first
    FailAfterReady(Duration),
    /// exits before ever being ready
    ExitBeforeReady(Option<&'static str>),
    /// ready at once, never exits once signalled
    IgnoreSignals,
    /// ready at once, fails when signalled
    FailOnStop,
}

pub struct Scripted {
    name: &'static str,
    events: Events,
    script: Script,
}

impl Scripted {
    pub fn new(name: &'static str, events: &Events, script: Script) -> Self {
        Self {
            name,
            events: events.clone(),
            script,
        }
    }

    fn record(&self, what: &str) {
        record(&self.events, format!("{}:{}", self.name, what));
    }

    fn record_signal(&self, signal: Option<Signal>) {
        match signal {
            Some(signal) => self.record(&format!("signal {:?}", signal)),
            None => self.record("signal closed"),
        }
    }
}

#[async_trait]
impl Runner for Scripted {
    async fn run(
        &mut self,
        mut signals: mpsc::Receiver<Signal>,
        ready: oneshot::Sender<()>,
    ) -> Result<(), Error> {
        self.record("start");

        match self.script {
            Script::ExitBeforeReady(failure) => {
                self.record("exit");
                return failure.map_or(Ok(()), |msg| Err(Error::from(msg)));
            }
            Script::ReadyAfter(delay) => {
                tokio::select! {
                    signal = signals.recv() => {
                        self.record_signal(signal);
                        self.record("exit");
                        return Ok(());
                    }
                    _ = time::sleep(delay) => (),
                }
            }
            _ => (),
        }

        ready.send(()).ok();
        self.record("ready");

        match self.script {
            Script::FailAfterReady(delay) => {
                tokio::select! {
                    signal = signals.recv() => {
                        self.record_signal(signal);
                        self.record("exit");
                        Ok(())
                    }
                    _ = time::sleep(delay) => {
                        self.record("failed");
                        Err(Error::from(format!("{} failed", self.name)))
                    }
                }
            }
            Script::IgnoreSignals => {
                let signal = signals.recv().await;
                self.record_signal(signal);
                futures::future::pending::<()>().await;
                Ok(())
            }
            Script::FailOnStop => {
                let signal = signals.recv().await;
                self.record_signal(signal);
                self.record("exit");
                Err(Error::from("failed to stop"))
            }
            _ => {
                let signal = signals.recv().await;
                self.record_signal(signal);
                self.record("exit");
                Ok(())
            }
        }
    }
}

/// One call made to an [`Instrumented`] client
#[derive(Clone, Debug)]
pub struct Call {
    pub at: Instant,
    pub op: &'static str,
    pub owner: String,
    pub ok: bool,
}

/// Wraps the in-memory backend, logging every call and injecting failures on request
#[derive(Clone, Default)]
pub struct Instrumented {
    inner: MemoryLeaseClient,
    calls: Arc<Mutex<Vec<Call>>>,
    fail_release: bool,
    fail_refresh: Arc<AtomicBool>,
    events: Option<Events>,
}

impl Instrumented {
    pub fn new(inner: MemoryLeaseClient) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub fn recording_into(mut self, events: &Events) -> Self {
        self.events = Some(events.clone());
        self
    }

    pub fn set_refresh_failing(&self, failing: bool) {
        self.fail_refresh.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self, op: &str) -> Vec<Call> {
        self.calls
            .lock()
            .expect("calls poisoned")
            .iter()
            .filter(|call| call.op == op)
            .cloned()
            .collect()
    }

    fn log<T>(&self, op: &'static str, owner: &str, result: &Result<T, LeaseError>) {
        self.calls.lock().expect("calls poisoned").push(Call {
            at: Instant::now(),
            op,
            owner: owner.to_string(),
            ok: result.is_ok(),
        });
        if let Some(events) = &self.events {
            record(events, format!("lease:{}", op));
        }
    }
}

#[async_trait]
impl LeaseClient for Instrumented {
    async fn register(
        &self,
        key: &str,
        owner: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), LeaseError> {
        let result = self.inner.register(key, owner, value, ttl).await;
        self.log("register", owner, &result);
        result
    }

    async fn refresh(&self, key: &str, owner: &str, ttl: Duration) -> Result<(), LeaseError> {
        let result = if self.fail_refresh.load(Ordering::SeqCst) {
            Err(LeaseError::Unavailable("injected refresh failure".to_string()))
        } else {
            self.inner.refresh(key, owner, ttl).await
        };
        self.log("refresh", owner, &result);
        result
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LeaseError> {
        let result = if self.fail_release {
            Err(LeaseError::Unavailable("injected release failure".to_string()))
        } else {
            self.inner.release(key, owner).await
        };
        self.log("release", owner, &result);
        result
    }
}
