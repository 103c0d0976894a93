// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, info};

use crate::NetError;

/// A blocking, connection-oriented byte pipe.
pub trait NetAccess {
    /// Resolves `address` (a host name or a literal IP) and connects to it.
    /// Any existing connection is dropped first.
    fn connect(&mut self, address: &str, port: u16) -> Result<(), NetError>;

    /// Sends all of `data`.
    fn send(&mut self, data: &[u8]) -> Result<(), NetError>;

    /// Waits up to `timeout` for data and performs exactly one read into
    /// `buf`, returning the number of bytes read. A read of zero bytes means
    /// the peer went away and is reported as [`NetError::Closed`].
    fn receive(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, NetError>;

    /// Closes the connection. Harmless if there isn't one.
    fn disconnect(&mut self);
}

/// [`NetAccess`] over a `std` TCP socket.
#[derive(Debug, Default)]
pub struct TcpNetAccess {
    stream: Option<TcpStream>,
}

impl TcpNetAccess {
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&mut self) -> Result<&mut TcpStream, NetError> {
        self.stream.as_mut().ok_or(NetError::Closed)
    }
}

/// Picks the address to connect to. IPv4 wins when both families resolve,
/// since embedded targets rarely listen on v6.
pub(crate) fn pick_address(
    addrs: impl IntoIterator<Item = SocketAddr>,
) -> Option<SocketAddr> {
    let mut v6 = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        v6.get_or_insert(addr);
    }
    v6
}

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl NetAccess for TcpNetAccess {
    fn connect(&mut self, address: &str, port: u16) -> Result<(), NetError> {
        self.disconnect();

        let addrs = (address, port).to_socket_addrs().map_err(|e| {
            debug!("resolving {address}: {e}");
            NetError::Resolve
        })?;
        let addr = pick_address(addrs).ok_or(NetError::Resolve)?;

        let stream = TcpStream::connect(addr).map_err(|e| {
            debug!("connecting to {addr}: {e}");
            NetError::Connect
        })?;
        // Requests are small and strictly alternate with responses.
        stream.set_nodelay(true).map_err(|_| NetError::Connect)?;

        info!("connected to {addr}");
        self.stream = Some(stream);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), NetError> {
        self.stream()?.write_all(data).map_err(|e| {
            debug!("send: {e}");
            NetError::Send
        })
    }

    fn receive(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, NetError> {
        let stream = self.stream()?;

        // A zero timeout would be rejected by the socket layer; treat it as
        // "wait forever", as SO_RCVTIMEO does.
        let timeout = (!timeout.is_zero()).then_some(timeout);
        stream
            .set_read_timeout(timeout)
            .map_err(|_| NetError::Receive)?;

        match stream.read(buf) {
            Ok(0) => Err(NetError::Closed),
            Ok(n) => Ok(n),
            Err(e) if is_timeout(e.kind()) => Err(NetError::Timeout),
            Err(e) => {
                debug!("receive: {e}");
                Err(NetError::Receive)
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            // The socket closes on drop regardless; shutdown just makes the
            // peer see it promptly.
            let _ = stream.shutdown(Shutdown::Both);
            debug!("disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn prefers_ipv4() {
        let picked = pick_address([
            addr("[::1]:1000"),
            addr("127.0.0.1:1000"),
            addr("10.0.0.1:1000"),
        ]);
        assert_eq!(picked, Some(addr("127.0.0.1:1000")));
    }

    #[test]
    fn falls_back_to_first_ipv6() {
        let picked = pick_address([addr("[::1]:1000"), addr("[fe80::1]:1000")]);
        assert_eq!(picked, Some(addr("[::1]:1000")));
        assert_eq!(pick_address(Vec::new()), None);
    }

    #[test]
    fn unconnected_socket_reports_closed() {
        let mut net = TcpNetAccess::default();
        assert_eq!(net.send(&[1]), Err(NetError::Closed));
        assert_eq!(
            net.receive(&mut [0; 4], Duration::from_millis(1)),
            Err(NetError::Closed)
        );
        net.disconnect();
        assert!(!net.is_connected());
    }
}
