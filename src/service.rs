// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The service's process group: the lock first, then the work that needs it

use std::sync::Arc;

use crate::config::Config;
use crate::lease::{LeaseClient, Presence};
use crate::procs::{LockMaintainer, Member, OrderedGroup, Worker};
use crate::Error;

pub const LOCK_MAINTAINER: &str = "lock-maintainer";
pub const WORKER: &str = "worker";

pub fn group(
    config: &Config,
    client: Arc<dyn LeaseClient>,
    presence: Presence,
) -> Result<OrderedGroup, Error> {
    let lock_maintainer = LockMaintainer::new(
        client,
        config.lock_key.clone(),
        presence,
        config.lock_retry_interval,
        config.lock_ttl,
    )?;
    let worker = Worker::new(config.worker_interval);

    let members = vec![
        Member::new(LOCK_MAINTAINER, lock_maintainer),
        Member::new(WORKER, worker),
    ];

    Ok(OrderedGroup::new(members)?.with_shutdown_timeout(config.shutdown_timeout))
}
