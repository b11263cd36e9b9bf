//! Socket multiplexing for one local address.
//!
//! A BACnet/IP node on a real interface listens on its unicast address and,
//! when the subnet has a directed broadcast address, on that address too.
//! The multiplexer owns the director(s) for both sockets, routes outbound
//! traffic to the right one, and delivers inbound frames to the Annex H or
//! Annex J leg by their leading octet, tagged with the destination kind
//! they arrived on.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, OnceLock, Weak};

use log::{debug, trace, warn};

use super::{DirectorConfig, UdpDirector};
use crate::comm::{bind, Binding, Client, CommError, Result, Server};
use crate::pdu::{Address, BipAddr, Pdu, BACNET_IP_PORT};

/// One upward-facing leg of the multiplexer.
///
/// The Annex J codec (or an Annex H server) binds on top of a leg the same
/// way any layer binds on a server below it.
pub struct MuxLeg {
    mux: Weak<UdpMultiplexer>,
    upstream: Binding<dyn Client>,
}

impl MuxLeg {
    fn new(mux: Weak<UdpMultiplexer>) -> Arc<Self> {
        Arc::new(Self {
            mux,
            upstream: Binding::new(),
        })
    }
}

impl Server for MuxLeg {
    fn indication(&self, pdu: Pdu) -> Result<()> {
        let mux = self.mux.upgrade().ok_or(CommError::NotBound)?;
        mux.route(pdu)
    }

    fn upstream(&self) -> &Binding<dyn Client> {
        &self.upstream
    }
}

/// Downward adapter bound on top of one director, remembering which socket
/// the traffic belongs to.
struct MuxPort {
    mux: Weak<UdpMultiplexer>,
    broadcast: bool,
    downstream: Binding<dyn Server>,
}

impl Client for MuxPort {
    fn confirmation(&self, pdu: Pdu) -> Result<()> {
        match self.mux.upgrade() {
            Some(mux) => mux.accept(self.broadcast, pdu),
            None => Ok(()),
        }
    }

    fn downstream(&self) -> &Binding<dyn Server> {
        &self.downstream
    }
}

/// The sockets of one local BACnet/IP address.
pub struct UdpMultiplexer {
    address: Option<BipAddr>,
    local: SocketAddrV4,
    broadcast_tuple: Option<SocketAddrV4>,
    direct: Arc<UdpDirector>,
    broadcast: Option<Arc<UdpDirector>>,
    direct_port: OnceLock<Arc<MuxPort>>,
    broadcast_port: OnceLock<Arc<MuxPort>>,
    /// Annex H (BACnet tunneling router) leg
    pub annex_h: Arc<MuxLeg>,
    /// Annex J (BACnet/IP) leg
    pub annex_j: Arc<MuxLeg>,
}

impl UdpMultiplexer {
    /// Bind the sockets for `address` and start their directors.
    ///
    /// With no address, a wildcard socket on the well-known port is bound
    /// and broadcasts use the all-ones address. With a masked address, the
    /// subnet's directed broadcast address gets a socket of its own.
    /// `no_broadcast` suppresses broadcast support entirely, as does a
    /// loopback address. Must be called from within a tokio runtime.
    pub fn bind(address: Option<BipAddr>, no_broadcast: bool) -> Result<Arc<Self>> {
        let (unicast_tuple, broadcast_tuple) = Self::derive_tuples(address, no_broadcast);
        let special = broadcast_tuple
            .map(|tuple| *tuple.ip() != Ipv4Addr::BROADCAST)
            .unwrap_or(false);

        let direct = UdpDirector::bind(
            unicast_tuple,
            DirectorConfig {
                broadcast: broadcast_tuple.is_some(),
                ..Default::default()
            },
        )?;
        let broadcast = match (special, broadcast_tuple) {
            (true, Some(tuple)) => Some(UdpDirector::bind(
                tuple,
                DirectorConfig {
                    broadcast: true,
                    reuse_address: true,
                    ..Default::default()
                },
            )?),
            _ => None,
        };

        let mux = Arc::new_cyclic(|me: &Weak<Self>| Self {
            address,
            local: direct.local_address(),
            broadcast_tuple,
            direct: direct.clone(),
            broadcast: broadcast.clone(),
            direct_port: OnceLock::new(),
            broadcast_port: OnceLock::new(),
            annex_h: MuxLeg::new(me.clone()),
            annex_j: MuxLeg::new(me.clone()),
        });

        let port = Arc::new(MuxPort {
            mux: Arc::downgrade(&mux),
            broadcast: false,
            downstream: Binding::new(),
        });
        bind(&port, &mux.direct)?;
        let _ = mux.direct_port.set(port);
        mux.direct.start()?;

        if let Some(director) = &mux.broadcast {
            let port = Arc::new(MuxPort {
                mux: Arc::downgrade(&mux),
                broadcast: true,
                downstream: Binding::new(),
            });
            bind(&port, director)?;
            let _ = mux.broadcast_port.set(port);
            director.start()?;
        }

        Ok(mux)
    }

    fn derive_tuples(
        address: Option<BipAddr>,
        no_broadcast: bool,
    ) -> (SocketAddrV4, Option<SocketAddrV4>) {
        match address {
            None => {
                let unicast = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, BACNET_IP_PORT);
                let broadcast = (!no_broadcast)
                    .then_some(SocketAddrV4::new(Ipv4Addr::BROADCAST, BACNET_IP_PORT));
                (unicast, broadcast)
            }
            Some(addr) => {
                let unicast = addr.socket_addr();
                let broadcast = if no_broadcast || addr.ip.is_loopback() {
                    None
                } else if addr.is_host() {
                    Some(SocketAddrV4::new(Ipv4Addr::BROADCAST, addr.port))
                } else {
                    Some(addr.broadcast())
                };
                (unicast, broadcast)
            }
        }
    }

    /// The configured local address, if one was given.
    pub fn address(&self) -> Option<BipAddr> {
        self.address
    }

    /// The bound unicast socket address.
    pub fn local_address(&self) -> SocketAddrV4 {
        self.local
    }

    /// The broadcast address outbound local broadcasts go to, if any.
    pub fn broadcast_address(&self) -> Option<SocketAddrV4> {
        self.broadcast_tuple
    }

    /// Close both directors, waiting for their loops to stop.
    pub async fn close(&self) {
        self.direct.close().await;
        if let Some(director) = &self.broadcast {
            director.close().await;
        }
    }

    fn route(&self, pdu: Pdu) -> Result<()> {
        match pdu.destination {
            Some(Address::LocalStation(_)) => {
                let port = self.direct_port.get().ok_or(CommError::NotBound)?;
                port.request(pdu)
            }
            Some(Address::LocalBroadcast) => {
                let tuple = self.broadcast_tuple.ok_or_else(|| {
                    CommError::InvalidAddress("no broadcast address on this interface".into())
                })?;
                let port = self
                    .broadcast_port
                    .get()
                    .or_else(|| self.direct_port.get())
                    .ok_or(CommError::NotBound)?;
                port.request(Pdu {
                    destination: Some(tuple.into()),
                    ..pdu
                })
            }
            other => Err(CommError::InvalidAddress(format!(
                "cannot route destination {other:?}"
            ))),
        }
    }

    fn accept(&self, via_broadcast: bool, pdu: Pdu) -> Result<()> {
        let Some(source) = pdu.source_socket() else {
            return Ok(());
        };
        if source == self.local {
            trace!("dropping frame from self");
            return Ok(());
        }
        if pdu.payload.is_empty() {
            return Ok(());
        }

        let destination = if via_broadcast {
            Address::LocalBroadcast
        } else {
            Address::LocalStation(self.local.into())
        };
        let leg = match pdu.payload[0] {
            0x01 => &self.annex_h,
            0x81 => &self.annex_j,
            other => {
                warn!("unrecognized link layer frame type 0x{other:02X} from {source}");
                return Ok(());
            }
        };
        match leg.upstream.get() {
            Ok(upper) => upper.confirmation(Pdu {
                destination: Some(destination),
                ..pdu
            }),
            Err(_) => {
                debug!("no server bound for inbound frame from {source}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bip::BipSimple;
    use crate::bvlc::AnnexJCodec;
    use crate::comm::testing::CapturingClient;
    use crate::pdu::Pdu;

    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn loopback_mux() -> Arc<UdpMultiplexer> {
        UdpMultiplexer::bind(Some(BipAddr::new(Ipv4Addr::LOCALHOST, 0)), false).unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_tuple_derivation() {
        // wildcard: well-known port, all-ones broadcast
        let (unicast, broadcast) = UdpMultiplexer::derive_tuples(None, false);
        assert_eq!(
            unicast,
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, BACNET_IP_PORT)
        );
        assert_eq!(
            broadcast,
            Some(SocketAddrV4::new(Ipv4Addr::BROADCAST, BACNET_IP_PORT))
        );

        // masked address: the subnet's directed broadcast
        let addr: BipAddr = "192.168.0.10/24:47809".parse().unwrap();
        let (unicast, broadcast) = UdpMultiplexer::derive_tuples(Some(addr), false);
        assert_eq!(unicast, addr.socket_addr());
        assert_eq!(broadcast, Some("192.168.0.255:47809".parse().unwrap()));

        // suppressed and loopback: no broadcast tuple at all
        assert_eq!(UdpMultiplexer::derive_tuples(Some(addr), true).1, None);
        let lo = BipAddr::new(Ipv4Addr::LOCALHOST, 47808);
        assert_eq!(UdpMultiplexer::derive_tuples(Some(lo), false).1, None);
    }

    fn stack(
        mux: &Arc<UdpMultiplexer>,
    ) -> (Arc<CapturingClient>, Arc<BipSimple>) {
        let codec = AnnexJCodec::new();
        let node = BipSimple::new();
        let app = CapturingClient::new();
        bind(&codec, &mux.annex_j).unwrap();
        bind(&node, &codec).unwrap();
        bind(&app, &node).unwrap();
        (app, node)
    }

    #[tokio::test]
    async fn test_unicast_npdu_end_to_end() {
        let mux_a = loopback_mux();
        let mux_b = loopback_mux();
        let (_, node_a) = stack(&mux_a);
        let (app_b, _) = stack(&mux_b);

        let dest = Address::LocalStation(mux_b.local_address().into());
        node_a
            .indication(Pdu::new(vec![0x01, 0x20, 0x00]).with_destination(dest))
            .unwrap();

        wait_until(|| app_b.len() == 1).await;
        let received = app_b.take();
        assert_eq!(received[0].payload.as_ref(), &[0x01, 0x20, 0x00]);
        assert_eq!(
            received[0].source,
            Some(Address::LocalStation(mux_a.local_address().into()))
        );
        // received on the unicast socket, so addressed to this station
        assert_eq!(
            received[0].destination,
            Some(Address::LocalStation(mux_b.local_address().into()))
        );

        mux_a.close().await;
        mux_b.close().await;
    }

    #[tokio::test]
    async fn test_broadcast_unavailable_on_loopback() {
        let mux = loopback_mux();
        let (_, node) = stack(&mux);

        let result =
            node.indication(Pdu::new(vec![0x01]).with_destination(Address::LocalBroadcast));
        assert!(matches!(result, Err(CommError::InvalidAddress(_))));

        mux.close().await;
    }

    #[tokio::test]
    async fn test_inbound_demux_by_leading_octet() {
        let mux = loopback_mux();
        let (app, _) = stack(&mux);

        let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // not a BVLL frame: dropped without disturbing the stack
        probe
            .send_to(&[0xFF, 0x00], mux.local_address())
            .await
            .unwrap();
        // a valid unicast NPDU afterwards still arrives
        probe
            .send_to(&[0x81, 0x0A, 0x00, 0x05, 0x42], mux.local_address())
            .await
            .unwrap();

        wait_until(|| app.len() == 1).await;
        assert_eq!(app.take()[0].payload.as_ref(), &[0x42]);

        mux.close().await;
    }

    #[tokio::test]
    async fn test_malformed_bvll_dropped_by_codec() {
        let mux = loopback_mux();
        let (app, _) = stack(&mux);

        let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // declared length lies about the frame size
        probe
            .send_to(&[0x81, 0x0A, 0x00, 0xFF, 0x42], mux.local_address())
            .await
            .unwrap();
        probe
            .send_to(&[0x81, 0x0A, 0x00, 0x05, 0x43], mux.local_address())
            .await
            .unwrap();

        wait_until(|| app.len() == 1).await;
        assert_eq!(app.take()[0].payload.as_ref(), &[0x43]);

        mux.close().await;
    }
}
