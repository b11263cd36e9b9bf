//! Plain BACnet/IP node.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};

use super::service_nak;
use crate::bvlc::{Bvlc, ResultCode};
use crate::comm::{Binding, Client, CommError, Result, Server};
use crate::pdu::{Address, Pdu};

/// A plain BACnet/IP node.
///
/// Translates outbound NPDUs into Original-Unicast or Original-Broadcast
/// frames and unwraps the inbound equivalents. Table service requests are
/// refused with the matching NAK, since a plain node keeps no broadcast
/// distribution or foreign device tables.
pub struct BipSimple {
    upstream: Binding<dyn Client>,
    downstream: Binding<dyn Server>,
}

impl BipSimple {
    /// Create a node ready to be bound into a stack.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            upstream: Binding::new(),
            downstream: Binding::new(),
        })
    }

    fn reply_nak(&self, pdu: &Pdu, code: ResultCode) -> Result<()> {
        let Some(source) = pdu.source else {
            warn!("cannot NAK a request without a source address");
            return Ok(());
        };
        self.request(
            Pdu::new(Bytes::new())
                .with_bvlc(Bvlc::Result(code))
                .with_destination(source),
        )
    }
}

impl Server for BipSimple {
    fn indication(&self, pdu: Pdu) -> Result<()> {
        match pdu.destination {
            Some(Address::LocalStation(_)) => {
                let message = Bvlc::OriginalUnicastNpdu {
                    npdu: pdu.payload.clone(),
                };
                self.request(Pdu::derived_from(&pdu, Bytes::new()).with_bvlc(message))
            }
            Some(Address::LocalBroadcast) => {
                let message = Bvlc::OriginalBroadcastNpdu {
                    npdu: pdu.payload.clone(),
                };
                self.request(Pdu::derived_from(&pdu, Bytes::new()).with_bvlc(message))
            }
            other => Err(CommError::InvalidAddress(format!(
                "cannot route destination {other:?}"
            ))),
        }
    }

    fn upstream(&self) -> &Binding<dyn Client> {
        &self.upstream
    }
}

impl Client for BipSimple {
    fn confirmation(&self, pdu: Pdu) -> Result<()> {
        let Some(message) = pdu.bvlc.clone() else {
            debug!("dropping frame without a decoded BVLC message");
            return Ok(());
        };

        match message {
            Bvlc::Result(_)
            | Bvlc::ReadBroadcastDistributionTableAck(_)
            | Bvlc::ReadForeignDeviceTableAck(_) => self.response(pdu),
            Bvlc::OriginalUnicastNpdu { npdu } => {
                let up = Pdu::derived_from(&pdu, npdu);
                self.response(up)
            }
            Bvlc::OriginalBroadcastNpdu { npdu } => {
                let up = Pdu::derived_from(&pdu, npdu).with_destination(Address::LocalBroadcast);
                self.response(up)
            }
            Bvlc::ForwardedNpdu { origin, npdu } => {
                // address the NPDU from its original sender, not the relaying BBMD
                let up = Pdu::derived_from(&pdu, npdu)
                    .with_source(origin.into())
                    .with_destination(Address::LocalBroadcast);
                self.response(up)
            }
            other => match service_nak(&other) {
                Some(code) => self.reply_nak(&pdu, code),
                None => {
                    debug!("plain node ignoring {}", other.function());
                    Ok(())
                }
            },
        }
    }

    fn downstream(&self) -> &Binding<dyn Server> {
        &self.downstream
    }
}
