// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::process;
use std::sync::Arc;

use tokio::runtime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lockstep::lease::ConsulLeaseClient;
use lockstep::procs::{self, SignalMonitor};
use lockstep::{identity, service, Config, Error};

fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lockstep=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = lockstep::config::app().get_matches();
    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid-configuration");
            process::exit(1);
        }
    };

    let runtime = match runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed-to-start-runtime");
            process::exit(1);
        }
    };

    let code = runtime.block_on(async move {
        match run(config).await {
            Ok(()) => {
                info!("exited");
                0
            }
            Err(err) => {
                error!(error = %err, "exited-with-failure");
                1
            }
        }
    });

    process::exit(code);
}

async fn run(config: Config) -> Result<(), Error> {
    info!("starting");

    let presence = identity::presence(config.listen_addr.port())?;
    let client = ConsulLeaseClient::connect(config.consul_cluster.clone()).await?;
    let group = service::group(&config, Arc::new(client), presence)?;

    let monitor = procs::invoke("monitor", SignalMonitor::new(group)).await;
    info!("started");

    monitor.wait().await
}
