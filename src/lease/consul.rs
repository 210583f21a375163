// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::{LeaseClient, LeaseError};

/// Per request limit, a hung agent must not stall a renewal past the lock TTL
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Consul refuses session TTLs shorter than this
const MIN_SESSION_TTL: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct SessionRequest<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "Behavior")]
    behavior: &'a str,
    #[serde(rename = "LockDelay")]
    lock_delay: &'a str,
}

#[derive(Deserialize)]
struct SessionResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct KvEntry {
    #[serde(rename = "Session", default)]
    session: Option<String>,
}

#[derive(Clone, Debug)]
struct Held {
    owner: String,
    session: String,
}

/// Session based locks against a Consul cluster
///
/// A registration creates a session carrying the TTL and acquires the key with
/// it. Refreshing renews the session and then checks the key still points at
/// it. Endpoints are tried in order until one answers.
pub struct ConsulLeaseClient {
    http: Client,
    endpoints: Vec<Url>,
    held: Mutex<HashMap<String, Held>>,
}

impl ConsulLeaseClient {
    /// Builds the client and checks that at least one endpoint answers
    pub async fn connect(endpoints: Vec<Url>) -> Result<Self, LeaseError> {
        if endpoints.is_empty() {
            return Err(LeaseError::Unavailable(
                "no coordination endpoints configured".to_string(),
            ));
        }

        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LeaseError::Unavailable(e.to_string()))?;

        let client = Self {
            http,
            endpoints,
            held: Mutex::new(HashMap::new()),
        };

        let response = client.send(Method::GET, "v1/status/leader", None).await?;
        expect_success("v1/status/leader", &response)?;
        Ok(client)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response, LeaseError> {
        let mut last_error = None;

        for endpoint in &self.endpoints {
            let url = endpoint
                .join(path)
                .map_err(|e| LeaseError::Protocol(format!("bad path {}: {}", path, e)))?;

            let mut request = self.http.request(method.clone(), url);
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    debug!(endpoint = %endpoint, error = %err, "endpoint-unreachable");
                    last_error = Some(err);
                }
            }
        }

        Err(LeaseError::Unavailable(
            last_error.map_or_else(|| "no endpoints".to_string(), |e| e.to_string()),
        ))
    }

    async fn create_session(&self, key: &str, ttl: Duration) -> Result<String, LeaseError> {
        let request = SessionRequest {
            name: key,
            ttl: session_ttl(ttl),
            behavior: "delete",
            lock_delay: "0s",
        };
        let body = serde_json::to_vec(&request).map_err(|e| LeaseError::Protocol(e.to_string()))?;

        let response = self
            .send(Method::PUT, "v1/session/create", Some(body))
            .await?;
        expect_success("v1/session/create", &response)?;

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| LeaseError::Protocol(e.to_string()))?;
        Ok(session.id)
    }

    async fn destroy_session(&self, session: &str) -> Result<(), LeaseError> {
        let path = format!("v1/session/destroy/{}", session);
        let response = self.send(Method::PUT, &path, None).await?;
        expect_success(&path, &response)
    }

    fn held(&self, key: &str, owner: &str) -> Result<Held, LeaseError> {
        let held = self
            .held
            .lock()
            .map_err(|_| LeaseError::Unavailable("session table lock poisoned".to_string()))?;

        match held.get(key) {
            Some(entry) if entry.owner == owner => Ok(entry.clone()),
            _ => Err(LeaseError::NotOwner(key.to_string())),
        }
    }

    fn set_held(&self, key: &str, entry: Option<Held>) {
        if let Ok(mut held) = self.held.lock() {
            match entry {
                Some(entry) => held.insert(key.to_string(), entry),
                None => held.remove(key),
            };
        }
    }
}

#[async_trait]
impl LeaseClient for ConsulLeaseClient {
    async fn register(
        &self,
        key: &str,
        owner: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), LeaseError> {
        let session = self.create_session(key, ttl).await?;

        let path = format!("v1/kv/{}?acquire={}", key, session);
        let acquired = match self.send(Method::PUT, &path, Some(value.to_vec())).await {
            Ok(response) => match expect_success(&path, &response) {
                Ok(()) => response
                    .json::<bool>()
                    .await
                    .map_err(|e| LeaseError::Protocol(e.to_string())),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match acquired {
            Ok(true) => {
                self.set_held(
                    key,
                    Some(Held {
                        owner: owner.to_string(),
                        session,
                    }),
                );
                Ok(())
            }
            Ok(false) => {
                self.destroy_session(&session).await.ok();
                Err(LeaseError::AlreadyHeld(key.to_string()))
            }
            Err(err) => {
                self.destroy_session(&session).await.ok();
                Err(err)
            }
        }
    }

    async fn refresh(&self, key: &str, owner: &str, _ttl: Duration) -> Result<(), LeaseError> {
        let held = self.held(key, owner)?;

        let path = format!("v1/session/renew/{}", held.session);
        let response = self.send(Method::PUT, &path, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            self.set_held(key, None);
            return Err(LeaseError::NotOwner(key.to_string()));
        }
        expect_success(&path, &response)?;

        let path = format!("v1/kv/{}", key);
        let response = self.send(Method::GET, &path, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            self.set_held(key, None);
            return Err(LeaseError::NotOwner(key.to_string()));
        }
        expect_success(&path, &response)?;

        let entries: Vec<KvEntry> = response
            .json()
            .await
            .map_err(|e| LeaseError::Protocol(e.to_string()))?;

        let still_ours = entries
            .first()
            .and_then(|entry| entry.session.as_deref())
            .map_or(false, |session| session == held.session);
        if !still_ours {
            self.set_held(key, None);
            self.destroy_session(&held.session).await.ok();
            return Err(LeaseError::NotOwner(key.to_string()));
        }

        Ok(())
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LeaseError> {
        let held = self.held(key, owner)?;
        self.set_held(key, None);

        let path = format!("v1/kv/{}?release={}", key, held.session);
        let released = match self.send(Method::PUT, &path, None).await {
            Ok(response) => expect_success(&path, &response),
            Err(err) => Err(err),
        };
        if let Err(err) = self.destroy_session(&held.session).await {
            warn!(session = %held.session, error = %err, "destroy-session-failed");
        }

        released
    }
}

fn expect_success(path: &str, response: &Response) -> Result<(), LeaseError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(LeaseError::Protocol(format!(
            "{} returned {}",
            path,
            response.status()
        )))
    }
}

fn session_ttl(ttl: Duration) -> String {
    format!("{}s", ttl.max(MIN_SESSION_TTL).as_secs())
}
