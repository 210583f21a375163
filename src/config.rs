// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Command line surface and the configuration built from it once at startup

use std::net::SocketAddr;
use std::time::Duration;

use clap::{App, Arg, ArgMatches};
use url::Url;

use crate::Error;

pub const LISTEN_ADDR: &str = "listenAddr";
pub const LOCK_TTL: &str = "lockTTL";
pub const LOCK_RETRY_INTERVAL: &str = "lockRetryInterval";
pub const LOCK_KEY: &str = "lockKey";
pub const CONSUL_CLUSTER: &str = "consulCluster";
pub const WORKER_INTERVAL: &str = "workerInterval";
pub const SHUTDOWN_TIMEOUT: &str = "shutdownTimeout";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9016";
const DEFAULT_LOCK_TTL: &str = "15s";
const DEFAULT_LOCK_RETRY_INTERVAL: &str = "5s";
const DEFAULT_LOCK_KEY: &str = "v1/locks/lockstep_lock";
const DEFAULT_WORKER_INTERVAL: &str = "5s";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub lock_ttl: Duration,
    pub lock_retry_interval: Duration,
    pub lock_key: String,
    pub consul_cluster: Vec<Url>,
    pub worker_interval: Duration,
    pub shutdown_timeout: Option<Duration>,
}

impl Config {
    pub fn from_args(args: &ArgMatches<'_>) -> Result<Self, Error> {
        let listen_addr = args.value_of(LISTEN_ADDR).unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen_addr = listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| Error::config(format!("invalid {} {}: {}", LISTEN_ADDR, listen_addr, e)))?;

        let config = Self {
            listen_addr,
            lock_ttl: duration_arg(args, LOCK_TTL, DEFAULT_LOCK_TTL)?,
            lock_retry_interval: duration_arg(
                args,
                LOCK_RETRY_INTERVAL,
                DEFAULT_LOCK_RETRY_INTERVAL,
            )?,
            lock_key: args
                .value_of(LOCK_KEY)
                .unwrap_or(DEFAULT_LOCK_KEY)
                .to_string(),
            consul_cluster: parse_endpoints(args.value_of(CONSUL_CLUSTER).unwrap_or(""))?,
            worker_interval: duration_arg(args, WORKER_INTERVAL, DEFAULT_WORKER_INTERVAL)?,
            shutdown_timeout: args
                .value_of(SHUTDOWN_TIMEOUT)
                .map(parse_duration)
                .transpose()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.lock_ttl == Duration::ZERO {
            return Err(Error::config(format!("{} must be greater than zero", LOCK_TTL)));
        }
        if self.lock_retry_interval == Duration::ZERO {
            return Err(Error::config(format!(
                "{} must be greater than zero",
                LOCK_RETRY_INTERVAL
            )));
        }
        if self.worker_interval == Duration::ZERO {
            return Err(Error::config(format!(
                "{} must be greater than zero",
                WORKER_INTERVAL
            )));
        }
        if self.lock_key.is_empty() {
            return Err(Error::config(format!("{} must not be empty", LOCK_KEY)));
        }
        if self.consul_cluster.is_empty() {
            return Err(Error::config(format!(
                "{} must list at least one endpoint",
                CONSUL_CLUSTER
            )));
        }

        Ok(())
    }
}

fn duration_arg(args: &ArgMatches<'_>, name: &str, default: &str) -> Result<Duration, Error> {
    parse_duration(args.value_of(name).unwrap_or(default))
}

fn validate_duration(value: String) -> Result<(), String> {
    parse_duration(&value).map(|_| ()).map_err(|e| e.to_string())
}

/// Parses durations such as `500ms`, `15s`, `2m` or `1h`
pub fn parse_duration(value: &str) -> Result<Duration, Error> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| value.len());
    let (amount, unit) = value.split_at(split);

    let amount = amount
        .parse::<u64>()
        .map_err(|_| Error::config(format!("invalid duration: {:?}", value)))?;

    let seconds = |per_unit: u64| {
        amount
            .checked_mul(per_unit)
            .map(Duration::from_secs)
            .ok_or_else(|| Error::config(format!("duration out of range: {:?}", value)))
    };

    let duration = match unit {
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => seconds(60)?,
        "h" => seconds(60 * 60)?,
        "" => {
            return Err(Error::config(format!(
                "duration needs a unit (ms, s, m, h): {:?}",
                value
            )))
        }
        _ => return Err(Error::config(format!("unknown duration unit: {:?}", value))),
    };

    Ok(duration)
}

/// Parses a comma separated list of `host:port` or `scheme://host:port` entries
pub fn parse_endpoints(list: &str) -> Result<Vec<Url>, Error> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let entry = if entry.contains("://") {
                entry.to_string()
            } else {
                format!("http://{}", entry)
            };

            let url = Url::parse(&entry)
                .map_err(|e| Error::config(format!("invalid endpoint {}: {}", entry, e)))?;
            if url.host().is_none() {
                return Err(Error::config(format!("endpoint has no host: {}", entry)));
            }
            Ok(url)
        })
        .collect()
}

pub fn app() -> App<'static, 'static> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name(LISTEN_ADDR)
                .long(LISTEN_ADDR)
                .value_name("HOST:PORT")
                .default_value(DEFAULT_LISTEN_ADDR)
                .validator(|addr| {
                    addr.parse::<SocketAddr>()
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                })
                .help("host:port to serve requests on, also advertised in the lock")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(LOCK_TTL)
                .long(LOCK_TTL)
                .value_name("DURATION")
                .default_value(DEFAULT_LOCK_TTL)
                .validator(validate_duration)
                .help("TTL for the service lock")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(LOCK_RETRY_INTERVAL)
                .long(LOCK_RETRY_INTERVAL)
                .value_name("DURATION")
                .default_value(DEFAULT_LOCK_RETRY_INTERVAL)
                .validator(validate_duration)
                .help("interval to wait before retrying a failed lock acquisition")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(LOCK_KEY)
                .long(LOCK_KEY)
                .value_name("KEY")
                .default_value(DEFAULT_LOCK_KEY)
                .help("key of the lock shared by all peers")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(CONSUL_CLUSTER)
                .long(CONSUL_CLUSTER)
                .value_name("ADDRS")
                .required(true)
                .help("comma-separated list of consul server addresses (ip:port)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(WORKER_INTERVAL)
                .long(WORKER_INTERVAL)
                .value_name("DURATION")
                .default_value(DEFAULT_WORKER_INTERVAL)
                .validator(validate_duration)
                .help("tick interval of the background worker")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(SHUTDOWN_TIMEOUT)
                .long(SHUTDOWN_TIMEOUT)
                .value_name("DURATION")
                .validator(validate_duration)
                .help("how long each member may take to exit once signalled, unbounded if unset")
                .takes_value(true),
        )
}
