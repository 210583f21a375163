// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

use crate::lease::LeaseError;

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("lease error: {0}")]
    Lease(#[from] LeaseError),
    #[error("member task failed: {0}")]
    Join(#[from] JoinError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("lock {key} is no longer owned by {owner}")]
    OwnershipLost { key: String, owner: String },
    #[error("{name} exited with failure: {source}")]
    Member {
        name: String,
        #[source]
        source: Box<Error>,
    },
    #[error("{0} exited before shutdown was requested")]
    MemberExited(String),
    #[error("{name} did not exit within {timeout:?} of being signalled")]
    ShutdownTimeout { name: String, timeout: Duration },
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// Annotates a member's terminal error with the member's name
    pub fn member(name: &str, source: Error) -> Self {
        Self::from_kind(ErrorKind::Member {
            name: name.to_string(),
            source: Box::new(source),
        })
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::from_kind(ErrorKind::Config(msg.into()))
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for ErrorKind {
    fn from(err: &'static str) -> Self {
        ErrorKind::ErrorStr(err)
    }
}

impl From<String> for ErrorKind {
    fn from(err: String) -> Self {
        ErrorKind::ErrorMsg(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_error_names_the_member() {
        let err = Error::member("worker", Error::from("boom"));

        assert_eq!(
            err.to_string(),
            "worker exited with failure: an error occured: boom"
        );
        match err.kind() {
            ErrorKind::Member { name, source } => {
                assert_eq!(name, "worker");
                assert!(matches!(source.kind(), ErrorKind::ErrorStr("boom")));
            }
            kind => panic!("unexpected kind: {:?}", kind),
        }
    }

    #[test]
    fn test_lease_error_converts() {
        let err = Error::from(LeaseError::NotOwner("v1/locks/test".to_string()));
        assert!(matches!(err.kind(), ErrorKind::Lease(LeaseError::NotOwner(_))));
    }
}
