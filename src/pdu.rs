//! BACnet/IP Addresses and Protocol Data Units
//!
//! This module provides the value types the link layer is built from: the
//! [`BipAddr`] host/subnet address, the [`Address`] kind enumeration used for
//! routing decisions, and the [`Pdu`] container passed between layers.
//!
//! # Overview
//!
//! A BACnet/IP address is an IPv4 host address plus a UDP port and a subnet
//! mask. The mask matters for broadcast management: a BBMD directs broadcasts
//! at a peer's subnet by sending to `ip | !mask`. Addresses are plain values
//! with full structural equality, so they can be kept in tables and compared
//! without any hidden state.
//!
//! PDUs carry a payload, optional source and destination addresses, opaque
//! user data, and (once the codec has run) the decoded BVLC message.

use std::any::Any;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;

use crate::bvlc::Bvlc;
use crate::comm::CommError;

/// BACnet/IP well-known port number (0xBAC0)
pub const BACNET_IP_PORT: u16 = 47808;

/// A BACnet/IP host address: IPv4 address, UDP port, and subnet mask.
///
/// The mask defaults to all-ones (a plain host address). Addresses compare
/// equal only when address, port, and mask all match.
///
/// # Examples
///
/// ```
/// use bacnet_bvll::pdu::BipAddr;
///
/// let addr: BipAddr = "192.168.3.4/24:47809".parse().unwrap();
/// assert_eq!(addr.port, 47809);
/// assert_eq!(addr.broadcast().to_string(), "192.168.3.255:47809");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BipAddr {
    /// IPv4 host address
    pub ip: Ipv4Addr,
    /// UDP port number
    pub port: u16,
    /// Subnet mask, all-ones for a host address
    pub mask: Ipv4Addr,
}

impl BipAddr {
    /// Create a host address with an all-ones mask.
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ip,
            port,
            mask: Ipv4Addr::BROADCAST,
        }
    }

    /// Create an address carrying an explicit subnet mask.
    pub fn with_mask(ip: Ipv4Addr, mask: Ipv4Addr, port: u16) -> Self {
        Self { ip, port, mask }
    }

    /// The unicast socket address of this host.
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    /// The directed broadcast address of this host's subnet, `ip | !mask`.
    pub fn broadcast(&self) -> SocketAddrV4 {
        let ip = Ipv4Addr::from(u32::from(self.ip) | !u32::from(self.mask));
        SocketAddrV4::new(ip, self.port)
    }

    /// Whether this is a plain host address (all-ones mask).
    pub fn is_host(&self) -> bool {
        self.mask == Ipv4Addr::BROADCAST
    }

    fn prefix_len(&self) -> u32 {
        u32::from(self.mask).leading_ones()
    }
}

impl From<SocketAddrV4> for BipAddr {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl fmt::Display for BipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ip)?;
        if !self.is_host() {
            write!(f, "/{}", self.prefix_len())?;
        }
        write!(f, ":{}", self.port)
    }
}

impl FromStr for BipAddr {
    type Err = CommError;

    /// Parse `"a.b.c.d"`, `"a.b.c.d:port"`, `"a.b.c.d/prefix"`, or
    /// `"a.b.c.d/prefix:port"`. Port defaults to [`BACNET_IP_PORT`], the
    /// mask to all-ones.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || CommError::InvalidAddress(format!("malformed address '{s}'"));

        let (host, port) = match s.split_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| bad())?),
            None => (s, BACNET_IP_PORT),
        };

        let (ip, mask) = match host.split_once('/') {
            Some((ip, prefix)) => {
                let prefix: u32 = prefix.parse().map_err(|_| bad())?;
                if prefix > 32 {
                    return Err(bad());
                }
                let mask = if prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - prefix)
                };
                (ip, Ipv4Addr::from(mask))
            }
            None => (host, Ipv4Addr::BROADCAST),
        };

        let ip: Ipv4Addr = ip.parse().map_err(|_| bad())?;
        Ok(Self { ip, port, mask })
    }
}

/// Address kinds used for routing decisions in the link layer.
///
/// Only `LocalStation` carries a routable host; `LocalBroadcast` is a pure
/// marker and matches only other `LocalBroadcast` values. The remote and
/// global kinds exist so upper layers can express destinations this layer
/// cannot route, which it reports as an addressing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// A single station on the local network
    LocalStation(BipAddr),
    /// Broadcast on the local network
    LocalBroadcast,
    /// A single station on a remote network
    RemoteStation(BipAddr),
    /// Broadcast on a remote network
    RemoteBroadcast(BipAddr),
    /// Broadcast on all networks
    Global,
}

impl Address {
    /// The socket address of a station kind, `None` for broadcast kinds.
    pub fn socket_addr(&self) -> Option<SocketAddrV4> {
        match self {
            Address::LocalStation(addr) | Address::RemoteStation(addr) => {
                Some(addr.socket_addr())
            }
            _ => None,
        }
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Address::LocalStation(addr.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::LocalStation(addr) => write!(f, "{addr}"),
            Address::LocalBroadcast => write!(f, "*"),
            Address::RemoteStation(addr) => write!(f, "remote {addr}"),
            Address::RemoteBroadcast(addr) => write!(f, "remote {addr} *"),
            Address::Global => write!(f, "*:*"),
        }
    }
}

/// A protocol data unit passed between layers.
///
/// The payload is the raw octets a layer below works with; `bvlc` is the
/// decoded link layer message once the codec has run. `user_data` is an
/// opaque value carried through the stack untouched, for callers that need
/// to correlate requests with their own context.
#[derive(Clone, Default)]
pub struct Pdu {
    /// Raw payload octets
    pub payload: Bytes,
    /// Where the PDU came from
    pub source: Option<Address>,
    /// Where the PDU is going
    pub destination: Option<Address>,
    /// Opaque caller context, carried through unchanged
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,
    /// Decoded link layer message, if any
    pub bvlc: Option<Bvlc>,
}

impl Pdu {
    /// Create a PDU carrying `payload` and nothing else.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Create a PDU carrying `payload` that inherits source, destination,
    /// and user data from `other`.
    pub fn derived_from(other: &Pdu, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            source: other.source,
            destination: other.destination,
            user_data: other.user_data.clone(),
            bvlc: None,
        }
    }

    /// Set the source address.
    pub fn with_source(mut self, source: Address) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the destination address.
    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Attach a decoded link layer message.
    pub fn with_bvlc(mut self, message: Bvlc) -> Self {
        self.bvlc = Some(message);
        self
    }

    /// The source socket address, when the source is a station.
    pub fn source_socket(&self) -> Option<SocketAddrV4> {
        self.source.and_then(|addr| addr.socket_addr())
    }
}

impl fmt::Debug for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview = hex::encode(&self.payload[..self.payload.len().min(8)]);
        f.debug_struct("Pdu")
            .field("payload", &format_args!("[{} octets] {preview}", self.payload.len()))
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("bvlc", &self.bvlc.as_ref().map(|m| m.function()))
            .finish()
    }
}
