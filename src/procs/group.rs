// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, FutureExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info};

use crate::procs::{Process, Runner, Signal};
use crate::{Error, ErrorKind};

/// Lifecycle of an [`OrderedGroup`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    Starting,
    Running,
    Stopping,
    Exited,
}

/// A named runner, declared in the order it should start
pub struct Member {
    name: String,
    runner: Box<dyn Runner>,
}

impl Member {
    pub fn new<N, R>(name: N, runner: R) -> Self
    where
        N: Into<String>,
        R: Runner + 'static,
    {
        Self {
            name: name.into(),
            runner: Box::new(runner),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member").field("name", &self.name).finish()
    }
}

/// Starts members one at a time and stops them in reverse
///
/// Rules:
///  - a member is only started once every member before it is ready
///  - the group is ready once every member is ready
///  - a signal to the group, or any member exiting, stops the group
///  - members are stopped last to first, each one only after all later ones exited
///  - the first failure is the group's result, annotated with the member name
pub struct OrderedGroup {
    members: Vec<Member>,
    stop_signal: Signal,
    shutdown_timeout: Option<Duration>,
    state: watch::Sender<GroupState>,
}

enum Startup {
    Ready,
    NotReady(Result<(), Error>),
    SiblingExited(usize, Result<(), Error>),
    Signalled(Option<Signal>),
}

enum Trigger {
    MemberExited(usize, Result<(), Error>),
    Signalled(Option<Signal>),
}

impl OrderedGroup {
    /// Members start in the order given, names must be unique
    pub fn new(members: Vec<Member>) -> Result<Self, Error> {
        if members.is_empty() {
            return Err(Error::config("a group needs at least one member"));
        }

        let mut names = HashSet::new();
        for member in &members {
            if !names.insert(member.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate member name: {}",
                    member.name
                )));
            }
        }

        let (state, _) = watch::channel(GroupState::Idle);
        Ok(Self {
            members,
            stop_signal: Signal::SIGINT,
            shutdown_timeout: None,
            state,
        })
    }

    /// The signal sent to members when the group stops because a member exited
    pub fn with_stop_signal(mut self, signal: Signal) -> Self {
        self.stop_signal = signal;
        self
    }

    /// How long each member gets to exit once signalled, `None` waits forever
    pub fn with_shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn state(&self) -> watch::Receiver<GroupState> {
        self.state.subscribe()
    }
}

/// Signals `running` last to first, waiting for each to exit before signalling the next
async fn stop(
    state: &watch::Sender<GroupState>,
    shutdown_timeout: Option<Duration>,
    running: Vec<Process>,
    signal: Signal,
    mut result: Result<(), Error>,
) -> Result<(), Error> {
    state.send_replace(GroupState::Stopping);

    for mut process in running.into_iter().rev() {
        info!(member = %process.name(), ?signal, "stopping");
        process.signal(signal);

        let exited = match shutdown_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, process.exited()).await {
                Ok(exited) => exited,
                Err(_) => {
                    error!(member = %process.name(), ?timeout, "shutdown-timed-out");
                    process.abort();
                    Err(ErrorKind::ShutdownTimeout {
                        name: process.name().to_string(),
                        timeout,
                    }
                    .into())
                }
            },
            None => process.exited().await,
        };

        match exited {
            Ok(()) => info!(member = %process.name(), "exited"),
            Err(err) => {
                error!(member = %process.name(), error = %err, "exited-with-failure");
                if result.is_ok() {
                    result = Err(annotate(process.name(), err));
                }
            }
        }
    }

    state.send_replace(GroupState::Exited);
    result
}

/// Wraps a member's exit in the member's name, timeouts already carry it
fn annotate(name: &str, err: Error) -> Error {
    match err.kind() {
        ErrorKind::ShutdownTimeout { .. } => err,
        _ => Error::member(name, err),
    }
}

/// The result of an unsolicited exit
fn unsolicited(name: &str, exited: Result<(), Error>) -> Error {
    match exited {
        Ok(()) => ErrorKind::MemberExited(name.to_string()).into(),
        Err(err) => Error::member(name, err),
    }
}

/// Resolves with the first of `running` to exit, never if there are none
async fn next_exit(running: &mut [Process]) -> (usize, Result<(), Error>) {
    if running.is_empty() {
        return future::pending().await;
    }

    let exits = running.iter_mut().map(|process| process.exited().boxed());
    let (exited, index, _) = future::select_all(exits).await;
    (index, exited)
}

#[async_trait]
impl Runner for OrderedGroup {
    async fn run(
        &mut self,
        mut signals: mpsc::Receiver<Signal>,
        ready: oneshot::Sender<()>,
    ) -> Result<(), Error> {
        if self.members.is_empty() {
            return Err(Error::from("group has already been run"));
        }
        let members = std::mem::take(&mut self.members);
        let stop_signal = self.stop_signal;
        let shutdown_timeout = self.shutdown_timeout;
        let state = &self.state;

        let mut running: Vec<Process> = Vec::with_capacity(members.len());
        state.send_replace(GroupState::Starting);

        for member in members {
            info!(member = %member.name, "starting");
            let (mut process, mut member_ready) = Process::spawn(&member.name, member.runner);

            let startup = tokio::select! {
                notice = &mut member_ready => match notice {
                    Ok(()) => Startup::Ready,
                    Err(_) => Startup::NotReady(process.exited().await),
                },
                (index, exited) = next_exit(&mut running) => Startup::SiblingExited(index, exited),
                signal = signals.recv() => Startup::Signalled(signal),
            };

            match startup {
                Startup::Ready => {
                    info!(member = %process.name(), "started");
                    running.push(process);
                }
                Startup::NotReady(exited) => {
                    let err = unsolicited(process.name(), exited);
                    error!(member = %process.name(), error = %err, "exited-before-ready");
                    return stop(state, shutdown_timeout, running, stop_signal, Err(err)).await;
                }
                Startup::SiblingExited(index, exited) => {
                    let sibling = running.remove(index);
                    let err = unsolicited(sibling.name(), exited);
                    error!(member = %sibling.name(), error = %err, "exited-with-failure");
                    // the member still starting was started last, so it stops first
                    running.push(process);
                    return stop(state, shutdown_timeout, running, stop_signal, Err(err)).await;
                }
                Startup::Signalled(signal) => {
                    running.push(process);
                    let signal = signal.unwrap_or(stop_signal);
                    info!(?signal, "signalled-while-starting");
                    return stop(state, shutdown_timeout, running, signal, Ok(())).await;
                }
            }
        }

        state.send_replace(GroupState::Running);
        ready.send(()).ok();

        let trigger = tokio::select! {
            (index, exited) = next_exit(&mut running) => Trigger::MemberExited(index, exited),
            signal = signals.recv() => Trigger::Signalled(signal),
        };

        match trigger {
            Trigger::MemberExited(index, exited) => {
                let process = running.remove(index);
                let err = unsolicited(process.name(), exited);
                error!(member = %process.name(), error = %err, "exited-with-failure");
                stop(state, shutdown_timeout, running, stop_signal, Err(err)).await
            }
            Trigger::Signalled(signal) => {
                let signal = signal.unwrap_or(stop_signal);
                info!(?signal, "signalled");
                stop(state, shutdown_timeout, running, signal, Ok(())).await
            }
        }
    }
}
