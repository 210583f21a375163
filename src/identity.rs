// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use uuid::Uuid;

use crate::lease::Presence;
use crate::Error;

pub const SERVER_SCHEME: &str = "http";

/// Any routable address works, connecting a UDP socket sends nothing
const ROUTE_PROBE: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 53);

/// A globally unique id for this instance
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// The local address the default route leaves from
pub fn local_ip() -> Result<IpAddr, Error> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(ROUTE_PROBE)?;
    Ok(socket.local_addr()?.ip())
}

pub fn presence_address(scheme: &str, ip: IpAddr, port: u16) -> String {
    format!("{}://{}", scheme, SocketAddr::new(ip, port))
}

/// Builds this instance's presence from a fresh id and the local address
pub fn presence(port: u16) -> Result<Presence, Error> {
    let address = presence_address(SERVER_SCHEME, local_ip()?, port);
    Ok(Presence::new(generate_id(), address))
}
