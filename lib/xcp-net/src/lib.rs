// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! XCP over TCP, host side.
//!
//! An XCP master (the update tool) talks to the bootloader one command at a
//! time. On TCP every command goes out as a single segment: a little-endian
//! 32-bit request counter followed by the command bytes. The reply comes
//! back the same way, with a 4-byte field in front that this layer strips
//! and otherwise ignores.
//!
//! [`NetAccess`] is the socket underneath, [`XcpTransport`] is the shape
//! every XCP transport has, and [`XcpNetTransport`] joins the two.

mod net;
mod transport;

pub use net::{NetAccess, TcpNetAccess};
pub use transport::{
    NetSettings, State, XcpNetTransport, XcpTransport, COUNTER_BYTES,
    PACKET_SIZE_MAX,
};

use std::fmt;

/// Socket-level failures.
///
/// Callers generally treat all of these the same way (the request got no
/// valid answer) but they are kept apart so logs can tell a slow target from
/// a dead one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NetError {
    /// The address didn't resolve to anything.
    Resolve,
    Connect,
    Send,
    Receive,
    /// Nothing arrived before the receive timeout.
    Timeout,
    /// The peer closed the connection, or there was no connection.
    Closed,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetError::Resolve => "could not resolve address",
            NetError::Connect => "could not connect",
            NetError::Send => "send failed",
            NetError::Receive => "receive failed",
            NetError::Timeout => "timed out waiting for response",
            NetError::Closed => "connection closed",
        };
        f.write_str(s)
    }
}

impl std::error::Error for NetError {}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum XcpError {
    /// `send_packet` was called without a live connection.
    NotConnected,
    Network(NetError),
    /// A response that can't hold the counter and at least one byte, or
    /// that overflowed the receive buffer.
    Framing { len: usize },
    /// The command doesn't fit in one packet.
    PacketTooLarge { len: usize, max: usize },
    InvalidSettings,
}

impl From<NetError> for XcpError {
    fn from(e: NetError) -> Self {
        XcpError::Network(e)
    }
}

impl fmt::Display for XcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XcpError::NotConnected => write!(f, "not connected"),
            XcpError::Network(e) => write!(f, "network error: {e}"),
            XcpError::Framing { len } => {
                write!(f, "malformed response of {len} bytes")
            }
            XcpError::PacketTooLarge { len, max } => {
                write!(f, "packet of {len} bytes exceeds maximum of {max}")
            }
            XcpError::InvalidSettings => write!(f, "invalid network settings"),
        }
    }
}

impl std::error::Error for XcpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            XcpError::Network(e) => Some(e),
            _ => None,
        }
    }
}
