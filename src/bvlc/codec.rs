//! Annex J codec layer.
//!
//! Sits between a BACnet/IP node and the UDP multiplexer: on the way down it
//! serializes the PDU's decoded [`Bvlc`] message into raw frame octets, on
//! the way up it parses received octets back into a message. The codec keeps
//! no state, so one instance can carry any number of concurrent stacks'
//! worth of traffic as long as each call owns its input.

use std::sync::Arc;

use log::warn;

use super::{Bvlc, CodecError};
use crate::comm::{Binding, Client, Result, Server};
use crate::pdu::Pdu;

/// Stateless translator between decoded BVLC messages and wire frames.
pub struct AnnexJCodec {
    upstream: Binding<dyn Client>,
    downstream: Binding<dyn Server>,
}

impl AnnexJCodec {
    /// Create a codec ready to be bound into a stack.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            upstream: Binding::new(),
            downstream: Binding::new(),
        })
    }
}

impl Server for AnnexJCodec {
    fn indication(&self, pdu: Pdu) -> Result<()> {
        let message = pdu.bvlc.as_ref().ok_or(CodecError::NothingToEncode)?;
        let frame = message.encode();
        self.request(Pdu {
            payload: frame,
            source: pdu.source,
            destination: pdu.destination,
            user_data: pdu.user_data,
            bvlc: None,
        })
    }

    fn upstream(&self) -> &Binding<dyn Client> {
        &self.upstream
    }
}

impl Client for AnnexJCodec {
    fn confirmation(&self, pdu: Pdu) -> Result<()> {
        match Bvlc::decode(pdu.payload.clone()) {
            Ok(message) => self.response(Pdu {
                bvlc: Some(message),
                ..pdu
            }),
            Err(e) => {
                // a malformed frame is dropped, it must not stall inbound traffic
                warn!(
                    "dropping malformed BVLL frame from {:?}: {}",
                    pdu.source, e
                );
                Ok(())
            }
        }
    }

    fn downstream(&self) -> &Binding<dyn Server> {
        &self.downstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvlc::ResultCode;
    use crate::comm::testing::{CapturingClient, CapturingServer};
    use crate::comm::{bind, CommError};
    use crate::pdu::Address;

    use bytes::Bytes;

    fn stack() -> (Arc<CapturingClient>, Arc<AnnexJCodec>, Arc<CapturingServer>) {
        let upper = CapturingClient::new();
        let codec = AnnexJCodec::new();
        let lower = CapturingServer::new();
        bind(&upper, &codec).unwrap();
        bind(&codec, &lower).unwrap();
        (upper, codec, lower)
    }

    #[test]
    fn test_indication_encodes_message() {
        let (_, codec, lower) = stack();

        codec
            .indication(
                Pdu::new(Bytes::new())
                    .with_bvlc(Bvlc::Result(ResultCode::Success))
                    .with_destination(Address::LocalBroadcast),
            )
            .unwrap();

        let sent = lower.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.as_ref(), &[0x81, 0x00, 0x00, 0x06, 0x00, 0x00]);
        assert_eq!(sent[0].destination, Some(Address::LocalBroadcast));
        assert!(sent[0].bvlc.is_none());
    }

    #[test]
    fn test_indication_without_message_fails() {
        let (_, codec, _) = stack();
        let result = codec.indication(Pdu::new(vec![0x81]));
        assert!(matches!(
            result,
            Err(CommError::Codec(CodecError::NothingToEncode))
        ));
    }

    #[test]
    fn test_confirmation_decodes_message() {
        let (upper, codec, _) = stack();
        let source = Address::LocalStation("10.0.1.90".parse().unwrap());

        codec
            .confirmation(Pdu::new(vec![0x81, 0x05, 0x00, 0x06, 0x00, 0x1E]).with_source(source))
            .unwrap();

        let received = upper.take();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].bvlc, Some(Bvlc::RegisterForeignDevice { ttl: 30 }));
        assert_eq!(received[0].source, Some(source));
    }

    #[test]
    fn test_malformed_frame_dropped() {
        let (upper, codec, _) = stack();

        codec
            .confirmation(Pdu::new(vec![0x82, 0x00, 0x00, 0x04]))
            .unwrap();

        assert_eq!(upper.len(), 0);
    }
}
