// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use log::{debug, trace, warn};
use serde::Deserialize;
use zerocopy::byteorder::little_endian as le;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{NetAccess, TcpNetAccess, XcpError};

/// Largest XCP packet the loader exchanges, excluding the TCP counter.
pub const PACKET_SIZE_MAX: usize = 255;

/// Size of the counter that prefixes every frame in both directions.
pub const COUNTER_BYTES: usize = core::mem::size_of::<FrameHeader>();

/// The counter in front of each request (our sequence number) and each
/// response (the target's DTO counter).
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
struct FrameHeader {
    counter: le::U32,
}

fn default_max_packet_size() -> usize {
    PACKET_SIZE_MAX
}

/// Where to find the target. Usually read from the `[net]` table of a TOML
/// config file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NetSettings {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl NetSettings {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            max_packet_size: PACKET_SIZE_MAX,
        }
    }

    fn validate(&self) -> Result<(), XcpError> {
        let usable = !self.address.is_empty()
            && self.port != 0
            && self.max_packet_size != 0;
        if !usable {
            return Err(XcpError::InvalidSettings);
        }
        Ok(())
    }
}

/// A link that carries one XCP command and brings back one response.
pub trait XcpTransport {
    fn connect(&mut self) -> Result<(), XcpError>;

    fn disconnect(&mut self);

    /// Sends `tx` and waits up to `timeout` for the response payload.
    fn send_packet(
        &mut self,
        tx: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, XcpError>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    /// Created, never connected.
    Initialized,
    Connected,
    Disconnected,
}

/// XCP over a TCP connection.
///
/// Dropping the transport disconnects it.
pub struct XcpNetTransport<N: NetAccess = TcpNetAccess> {
    settings: NetSettings,
    net: N,
    state: State,
    /// Value to put on the next request.
    counter: u32,
    buf: Vec<u8>,
}

impl XcpNetTransport<TcpNetAccess> {
    pub fn new(settings: NetSettings) -> Result<Self, XcpError> {
        Self::with_net(settings, TcpNetAccess::default())
    }
}

impl<N: NetAccess> XcpNetTransport<N> {
    pub fn with_net(settings: NetSettings, net: N) -> Result<Self, XcpError> {
        settings.validate()?;
        let buf = Vec::with_capacity(COUNTER_BYTES + settings.max_packet_size);
        Ok(Self {
            settings,
            net,
            state: State::Initialized,
            counter: 1,
            buf,
        })
    }

    pub fn settings(&self) -> &NetSettings {
        &self.settings
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The counter the next request will carry.
    pub fn next_counter(&self) -> u32 {
        self.counter
    }

    pub fn net(&self) -> &N {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut N {
        &mut self.net
    }

    /// Disconnects (if needed) and releases the transport.
    pub fn terminate(self) {
        drop(self);
    }
}

impl<N: NetAccess> XcpTransport for XcpNetTransport<N> {
    fn connect(&mut self) -> Result<(), XcpError> {
        self.disconnect();
        self.counter = 1;

        let NetSettings { address, port, .. } = &self.settings;
        if let Err(e) = self.net.connect(address, *port) {
            warn!("connecting to {address}:{port}: {e}");
            // Whatever came before, a failed connect starts over.
            self.state = State::Initialized;
            return Err(XcpError::Network(e));
        }
        self.state = State::Connected;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.net.disconnect();
        if self.state == State::Connected {
            self.state = State::Disconnected;
        }
    }

    fn send_packet(
        &mut self,
        tx: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, XcpError> {
        if self.state != State::Connected {
            return Err(XcpError::NotConnected);
        }
        let max = self.settings.max_packet_size;
        if tx.len() > max {
            return Err(XcpError::PacketTooLarge { len: tx.len(), max });
        }

        let header = FrameHeader {
            counter: le::U32::new(self.counter),
        };
        // The counter numbers requests, not deliveries.
        self.counter = self.counter.wrapping_add(1);

        self.buf.clear();
        self.buf.extend_from_slice(header.as_bytes());
        self.buf.extend_from_slice(tx);
        debug!("-> #{} {:02x?}", header.counter.get(), tx);
        self.net.send(&self.buf)?;

        self.buf.resize(COUNTER_BYTES + max, 0);
        let len = self.net.receive(&mut self.buf, timeout)?;
        if len <= COUNTER_BYTES || len > self.buf.len() {
            warn!("dropping response of {len} bytes");
            return Err(XcpError::Framing { len });
        }

        let (header, payload) = FrameHeader::read_from_prefix(&self.buf[..len])
            .map_err(|_| XcpError::Framing { len })?;
        // Not checked against the request: servers are free to keep their own
        // count here.
        trace!("response counter {}", header.counter.get());
        debug!("<- {payload:02x?}");
        Ok(payload.to_vec())
    }
}

impl<N: NetAccess> Drop for XcpNetTransport<N> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetError;
    use std::collections::VecDeque;

    /// Records what was sent and replays canned responses.
    #[derive(Default)]
    struct Scripted {
        connected: bool,
        connects: usize,
        sent: Vec<Vec<u8>>,
        replies: VecDeque<Result<Vec<u8>, NetError>>,
        refuse_connect: bool,
    }

    impl Scripted {
        fn reply(&mut self, bytes: &[u8]) {
            self.replies.push_back(Ok(bytes.to_vec()));
        }
    }

    impl NetAccess for Scripted {
        fn connect(&mut self, _: &str, _: u16) -> Result<(), NetError> {
            if self.refuse_connect {
                return Err(NetError::Connect);
            }
            self.connects += 1;
            self.connected = true;
            Ok(())
        }

        fn send(&mut self, data: &[u8]) -> Result<(), NetError> {
            if !self.connected {
                return Err(NetError::Closed);
            }
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn receive(
            &mut self,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, NetError> {
            let reply =
                self.replies.pop_front().unwrap_or(Err(NetError::Timeout))?;
            // Model a single read: anything that doesn't fit is reported at
            // full length so the overflow check can see it.
            let n = usize::min(reply.len(), buf.len());
            buf[..n].copy_from_slice(&reply[..n]);
            Ok(reply.len())
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }
    }

    const T: Duration = Duration::from_millis(100);

    fn connected() -> XcpNetTransport<Scripted> {
        let mut t = XcpNetTransport::with_net(
            NetSettings::new("target", 1000),
            Scripted::default(),
        )
        .unwrap();
        t.connect().unwrap();
        t
    }

    fn counters(t: &XcpNetTransport<Scripted>) -> Vec<u32> {
        t.net()
            .sent
            .iter()
            .map(|f| u32::from_le_bytes([f[0], f[1], f[2], f[3]]))
            .collect()
    }

    #[test]
    fn frames_request_and_strips_response() {
        let mut t = connected();
        t.net_mut().reply(&[9, 9, 9, 9, 0xff, 0x10]);
        let rx = t.send_packet(&[0xff, 0x00], T).unwrap();
        assert_eq!(rx, [0xff, 0x10]);
        assert_eq!(t.net().sent, [vec![1, 0, 0, 0, 0xff, 0x00]]);
    }

    #[test]
    fn counter_counts_and_resets_on_connect() {
        let mut t = connected();
        for _ in 0..3 {
            t.net_mut().reply(&[0, 0, 0, 0, 0xff]);
            t.send_packet(&[0xff], T).unwrap();
        }
        t.connect().unwrap();
        t.net_mut().reply(&[0, 0, 0, 0, 0xff]);
        t.send_packet(&[0xff], T).unwrap();
        assert_eq!(counters(&t), [1, 2, 3, 1]);
    }

    #[test]
    fn counter_advances_on_failure() {
        let mut t = connected();
        // Timeout, then short response.
        assert_eq!(
            t.send_packet(&[1], T),
            Err(XcpError::Network(NetError::Timeout))
        );
        t.net_mut().reply(&[0, 0, 0]);
        assert_eq!(t.send_packet(&[1], T), Err(XcpError::Framing { len: 3 }));
        t.net_mut().reply(&[0, 0, 0, 0, 0xff]);
        t.send_packet(&[1], T).unwrap();
        assert_eq!(counters(&t), [1, 2, 3]);
    }

    #[test]
    fn rejects_bad_lengths() {
        let mut t = connected();
        t.net_mut().reply(&[0, 0, 0, 0]);
        assert_eq!(t.send_packet(&[1], T), Err(XcpError::Framing { len: 4 }));

        let huge = vec![0; COUNTER_BYTES + PACKET_SIZE_MAX + 1];
        t.net_mut().reply(&huge);
        assert_eq!(
            t.send_packet(&[1], T),
            Err(XcpError::Framing { len: huge.len() })
        );

        let full = vec![0xff; COUNTER_BYTES + PACKET_SIZE_MAX];
        t.net_mut().reply(&full);
        assert_eq!(t.send_packet(&[1], T).unwrap().len(), PACKET_SIZE_MAX);
    }

    #[test]
    fn response_counter_is_not_checked() {
        let mut t = connected();
        // A server that echoes nothing useful in the counter field is
        // accepted.
        t.net_mut().reply(&[0xde, 0xad, 0xbe, 0xef, 0xff]);
        assert_eq!(t.send_packet(&[0xff, 0], T).unwrap(), [0xff]);
    }

    #[test]
    fn oversize_request_does_not_consume_counter() {
        let mut t = connected();
        let tx = vec![0; PACKET_SIZE_MAX + 1];
        assert_eq!(
            t.send_packet(&tx, T),
            Err(XcpError::PacketTooLarge {
                len: PACKET_SIZE_MAX + 1,
                max: PACKET_SIZE_MAX
            })
        );
        assert_eq!(t.next_counter(), 1);
        assert!(t.net().sent.is_empty());
    }

    #[test]
    fn state_machine() {
        let mut t = XcpNetTransport::with_net(
            NetSettings::new("target", 1000),
            Scripted {
                refuse_connect: true,
                ..Scripted::default()
            },
        )
        .unwrap();
        assert_eq!(t.settings(), &NetSettings::new("target", 1000));
        assert_eq!(t.state(), State::Initialized);
        assert_eq!(t.send_packet(&[1], T), Err(XcpError::NotConnected));

        assert_eq!(t.connect(), Err(XcpError::Network(NetError::Connect)));
        assert_eq!(t.state(), State::Initialized);

        t.net_mut().refuse_connect = false;
        t.connect().unwrap();
        assert_eq!(t.state(), State::Connected);

        t.disconnect();
        t.disconnect();
        assert_eq!(t.state(), State::Disconnected);
        assert_eq!(t.send_packet(&[1], T), Err(XcpError::NotConnected));
        assert_eq!(t.net().connects, 1);
        assert_eq!(t.next_counter(), 1);
    }

    #[test]
    fn failed_reconnect_returns_to_initialized() {
        let mut t = connected();
        t.disconnect();
        assert_eq!(t.state(), State::Disconnected);

        t.net_mut().refuse_connect = true;
        assert_eq!(t.connect(), Err(XcpError::Network(NetError::Connect)));
        assert_eq!(t.state(), State::Initialized);
        assert_eq!(t.send_packet(&[1], T), Err(XcpError::NotConnected));

        // Failing while connected tears the old connection down too.
        t.net_mut().refuse_connect = false;
        t.connect().unwrap();
        t.net_mut().refuse_connect = true;
        assert!(t.connect().is_err());
        assert_eq!(t.state(), State::Initialized);
        assert!(!t.net().connected);
    }

    #[test]
    fn rejects_bad_settings() {
        for settings in [
            NetSettings::new("", 1000),
            NetSettings::new("target", 0),
            NetSettings {
                max_packet_size: 0,
                ..NetSettings::new("target", 1000)
            },
        ] {
            assert!(matches!(
                XcpNetTransport::with_net(settings, Scripted::default()),
                Err(XcpError::InvalidSettings)
            ));
        }
    }

    #[test]
    fn settings_from_toml() {
        let s: NetSettings =
            toml::from_str("address = \"192.168.178.23\"\nport = 1000\n")
                .unwrap();
        assert_eq!(s, NetSettings::new("192.168.178.23", 1000));

        let s: NetSettings = toml::from_str(
            "address = \"target\"\nport = 1000\nmax_packet_size = 64\n",
        )
        .unwrap();
        assert_eq!(s.max_packet_size, 64);

        let unknown = "address = \"x\"\nport = 1\nbogus = 1\n";
        assert!(toml::from_str::<NetSettings>(unknown).is_err());
    }

    proptest::proptest! {
        #[test]
        fn payloads_pass_through(
            tx in proptest::collection::vec(0u8.., 0..=PACKET_SIZE_MAX),
            rx in proptest::collection::vec(0u8.., 1..=PACKET_SIZE_MAX),
            dto in 0u32..,
        ) {
            let mut t = connected();
            let mut reply = dto.to_le_bytes().to_vec();
            reply.extend_from_slice(&rx);
            t.net_mut().reply(&reply);

            proptest::prop_assert_eq!(t.send_packet(&tx, T), Ok(rx));
            let sent = &t.net().sent[0];
            proptest::prop_assert_eq!(&sent[..4], &[1u8, 0, 0, 0]);
            proptest::prop_assert_eq!(&sent[4..], &tx[..]);
        }
    }
}
