//! BACnet Virtual Link Control Messages
//!
//! This module implements the BVLC wire format defined in ASHRAE 135
//! Annex J. Every BACnet/IP datagram starts with a four-octet header:
//!
//! ```text
//! +------+----------+----------------------+
//! | 0x81 | function | length (incl header) |
//! +------+----------+----------------------+
//! ```
//!
//! followed by a function-specific body. [`Bvlc`] models the closed set of
//! message types as one enum; [`Bvlc::encode`] and [`Bvlc::decode`] translate
//! between the typed form and raw frames. Decoding validates the BVLL type
//! octet, the function code, the declared length, and the body shape, so a
//! decoded value is always internally consistent.
//!
//! # BVLC Functions
//!
//! - Result
//! - Write-Broadcast-Distribution-Table
//! - Read-Broadcast-Distribution-Table (+ Ack)
//! - Forwarded-NPDU
//! - Register-Foreign-Device
//! - Read-Foreign-Device-Table (+ Ack)
//! - Delete-Foreign-Device-Table-Entry
//! - Distribute-Broadcast-To-Network
//! - Original-Unicast-NPDU
//! - Original-Broadcast-NPDU

mod codec;

pub use codec::AnnexJCodec;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::pdu::BipAddr;

/// BVLL type octet for BACnet/IP
pub const BVLL_TYPE_BACNET_IP: u8 = 0x81;

/// Size of the BVLC header in octets
pub const BVLL_HEADER_SIZE: usize = 4;

/// Maximum BVLL frame length
pub const MAX_BVLL_LENGTH: usize = 1497;

/// Octets of one broadcast distribution table entry on the wire
const BDT_ENTRY_SIZE: usize = 10;

/// Octets of one foreign device table entry on the wire
const FDT_ENTRY_SIZE: usize = 10;

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors raised while encoding or decoding BVLC frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame shorter than the BVLC header
    #[error("frame truncated")]
    Truncated,
    /// First octet is not the BACnet/IP BVLL type
    #[error("invalid BVLL type 0x{0:02X}")]
    InvalidBvllType(u8),
    /// Function octet matches no known message type
    #[error("unknown BVLC function 0x{0:02X}")]
    UnknownFunction(u8),
    /// Result code matches no known value
    #[error("unknown result code 0x{0:04X}")]
    UnknownResultCode(u16),
    /// Declared frame length disagrees with the received octet count
    #[error("declared length {declared} does not match frame length {actual}")]
    LengthMismatch { declared: u16, actual: usize },
    /// Body length inconsistent with the declared message structure
    #[error("invalid body length {length} for {function}")]
    InvalidBody {
        function: BvlcFunction,
        length: usize,
    },
    /// The PDU carries no decoded message to serialize
    #[error("PDU carries no BVLC message to encode")]
    NothingToEncode,
}

/// BVLC function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BvlcFunction {
    /// Result
    Result = 0x00,
    /// Write-Broadcast-Distribution-Table
    WriteBroadcastDistributionTable = 0x01,
    /// Read-Broadcast-Distribution-Table
    ReadBroadcastDistributionTable = 0x02,
    /// Read-Broadcast-Distribution-Table-Ack
    ReadBroadcastDistributionTableAck = 0x03,
    /// Forwarded-NPDU
    ForwardedNpdu = 0x04,
    /// Register-Foreign-Device
    RegisterForeignDevice = 0x05,
    /// Read-Foreign-Device-Table
    ReadForeignDeviceTable = 0x06,
    /// Read-Foreign-Device-Table-Ack
    ReadForeignDeviceTableAck = 0x07,
    /// Delete-Foreign-Device-Table-Entry
    DeleteForeignDeviceTableEntry = 0x08,
    /// Distribute-Broadcast-To-Network
    DistributeBroadcastToNetwork = 0x09,
    /// Original-Unicast-NPDU
    OriginalUnicastNpdu = 0x0A,
    /// Original-Broadcast-NPDU
    OriginalBroadcastNpdu = 0x0B,
}

impl BvlcFunction {
    /// Convert from the wire octet, `None` for unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Result),
            0x01 => Some(Self::WriteBroadcastDistributionTable),
            0x02 => Some(Self::ReadBroadcastDistributionTable),
            0x03 => Some(Self::ReadBroadcastDistributionTableAck),
            0x04 => Some(Self::ForwardedNpdu),
            0x05 => Some(Self::RegisterForeignDevice),
            0x06 => Some(Self::ReadForeignDeviceTable),
            0x07 => Some(Self::ReadForeignDeviceTableAck),
            0x08 => Some(Self::DeleteForeignDeviceTableEntry),
            0x09 => Some(Self::DistributeBroadcastToNetwork),
            0x0A => Some(Self::OriginalUnicastNpdu),
            0x0B => Some(Self::OriginalBroadcastNpdu),
            _ => None,
        }
    }
}

impl fmt::Display for BvlcFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Result => "Result",
            Self::WriteBroadcastDistributionTable => "Write-Broadcast-Distribution-Table",
            Self::ReadBroadcastDistributionTable => "Read-Broadcast-Distribution-Table",
            Self::ReadBroadcastDistributionTableAck => "Read-Broadcast-Distribution-Table-Ack",
            Self::ForwardedNpdu => "Forwarded-NPDU",
            Self::RegisterForeignDevice => "Register-Foreign-Device",
            Self::ReadForeignDeviceTable => "Read-Foreign-Device-Table",
            Self::ReadForeignDeviceTableAck => "Read-Foreign-Device-Table-Ack",
            Self::DeleteForeignDeviceTableEntry => "Delete-Foreign-Device-Table-Entry",
            Self::DistributeBroadcastToNetwork => "Distribute-Broadcast-To-Network",
            Self::OriginalUnicastNpdu => "Original-Unicast-NPDU",
            Self::OriginalBroadcastNpdu => "Original-Broadcast-NPDU",
        };
        f.write_str(name)
    }
}

/// Result codes carried by BVLC Result messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResultCode {
    /// Successful completion
    Success = 0x0000,
    /// Write-Broadcast-Distribution-Table refused
    WriteBdtNak = 0x0010,
    /// Read-Broadcast-Distribution-Table refused
    ReadBdtNak = 0x0020,
    /// Register-Foreign-Device refused
    RegisterForeignDeviceNak = 0x0030,
    /// Read-Foreign-Device-Table refused
    ReadFdtNak = 0x0040,
    /// Delete-Foreign-Device-Table-Entry refused
    DeleteFdtEntryNak = 0x0050,
    /// Distribute-Broadcast-To-Network refused
    DistributeBroadcastNak = 0x0060,
}

impl ResultCode {
    /// Convert from the wire value, `None` for unknown codes.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Success),
            0x0010 => Some(Self::WriteBdtNak),
            0x0020 => Some(Self::ReadBdtNak),
            0x0030 => Some(Self::RegisterForeignDeviceNak),
            0x0040 => Some(Self::ReadFdtNak),
            0x0050 => Some(Self::DeleteFdtEntryNak),
            0x0060 => Some(Self::DistributeBroadcastNak),
            _ => None,
        }
    }

    /// Whether this code reports success.
    pub fn is_success(&self) -> bool {
        *self == Self::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", *self as u16)
    }
}

/// One foreign device table entry.
///
/// `remaining` counts down once a second; the entry is dropped when it
/// reaches zero. On the wire it is clamped to sixteen bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtEntry {
    /// The registered foreign device
    pub address: SocketAddrV4,
    /// Time-to-live requested at registration, in seconds
    pub ttl: u16,
    /// Seconds until the registration expires
    pub remaining: u32,
}

/// A decoded BVLC message.
///
/// # Examples
///
/// ```
/// use bacnet_bvll::bvlc::{Bvlc, ResultCode};
///
/// let frame = Bvlc::Result(ResultCode::Success).encode();
/// assert_eq!(frame.as_ref(), &[0x81, 0x00, 0x00, 0x06, 0x00, 0x00]);
/// assert_eq!(Bvlc::decode(frame).unwrap(), Bvlc::Result(ResultCode::Success));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bvlc {
    /// Outcome of a previously received request
    Result(ResultCode),
    /// Replace the receiver's broadcast distribution table
    WriteBroadcastDistributionTable(Vec<BipAddr>),
    /// Ask for the receiver's broadcast distribution table
    ReadBroadcastDistributionTable,
    /// The receiver's broadcast distribution table
    ReadBroadcastDistributionTableAck(Vec<BipAddr>),
    /// An NPDU relayed on behalf of its original sender
    ForwardedNpdu {
        /// The station the NPDU originally came from
        origin: SocketAddrV4,
        /// The relayed NPDU octets
        npdu: Bytes,
    },
    /// Register the sender as a foreign device
    RegisterForeignDevice {
        /// Requested registration time-to-live in seconds
        ttl: u16,
    },
    /// Ask for the receiver's foreign device table
    ReadForeignDeviceTable,
    /// The receiver's foreign device table
    ReadForeignDeviceTableAck(Vec<FdtEntry>),
    /// Remove one foreign device registration
    DeleteForeignDeviceTableEntry {
        /// The registration to remove
        address: SocketAddrV4,
    },
    /// Ask a BBMD to broadcast an NPDU on the sender's behalf
    DistributeBroadcastToNetwork {
        /// The NPDU octets to distribute
        npdu: Bytes,
    },
    /// An NPDU sent directly to one station
    OriginalUnicastNpdu {
        /// The NPDU octets
        npdu: Bytes,
    },
    /// An NPDU broadcast on the local network
    OriginalBroadcastNpdu {
        /// The NPDU octets
        npdu: Bytes,
    },
}

impl Bvlc {
    /// The function code of this message.
    pub fn function(&self) -> BvlcFunction {
        match self {
            Bvlc::Result(_) => BvlcFunction::Result,
            Bvlc::WriteBroadcastDistributionTable(_) => {
                BvlcFunction::WriteBroadcastDistributionTable
            }
            Bvlc::ReadBroadcastDistributionTable => BvlcFunction::ReadBroadcastDistributionTable,
            Bvlc::ReadBroadcastDistributionTableAck(_) => {
                BvlcFunction::ReadBroadcastDistributionTableAck
            }
            Bvlc::ForwardedNpdu { .. } => BvlcFunction::ForwardedNpdu,
            Bvlc::RegisterForeignDevice { .. } => BvlcFunction::RegisterForeignDevice,
            Bvlc::ReadForeignDeviceTable => BvlcFunction::ReadForeignDeviceTable,
            Bvlc::ReadForeignDeviceTableAck(_) => BvlcFunction::ReadForeignDeviceTableAck,
            Bvlc::DeleteForeignDeviceTableEntry { .. } => {
                BvlcFunction::DeleteForeignDeviceTableEntry
            }
            Bvlc::DistributeBroadcastToNetwork { .. } => {
                BvlcFunction::DistributeBroadcastToNetwork
            }
            Bvlc::OriginalUnicastNpdu { .. } => BvlcFunction::OriginalUnicastNpdu,
            Bvlc::OriginalBroadcastNpdu { .. } => BvlcFunction::OriginalBroadcastNpdu,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Bvlc::Result(_) => 2,
            Bvlc::WriteBroadcastDistributionTable(entries)
            | Bvlc::ReadBroadcastDistributionTableAck(entries) => entries.len() * BDT_ENTRY_SIZE,
            Bvlc::ReadBroadcastDistributionTable | Bvlc::ReadForeignDeviceTable => 0,
            Bvlc::ForwardedNpdu { npdu, .. } => 6 + npdu.len(),
            Bvlc::RegisterForeignDevice { .. } => 2,
            Bvlc::ReadForeignDeviceTableAck(entries) => entries.len() * FDT_ENTRY_SIZE,
            Bvlc::DeleteForeignDeviceTableEntry { .. } => 6,
            Bvlc::DistributeBroadcastToNetwork { npdu }
            | Bvlc::OriginalUnicastNpdu { npdu }
            | Bvlc::OriginalBroadcastNpdu { npdu } => npdu.len(),
        }
    }

    /// Serialize the message, header included.
    pub fn encode(&self) -> Bytes {
        let body_len = self.body_len();
        let mut buf = BytesMut::with_capacity(BVLL_HEADER_SIZE + body_len);
        buf.put_u8(BVLL_TYPE_BACNET_IP);
        buf.put_u8(self.function() as u8);
        buf.put_u16((BVLL_HEADER_SIZE + body_len) as u16);

        match self {
            Bvlc::Result(code) => buf.put_u16(*code as u16),
            Bvlc::WriteBroadcastDistributionTable(entries)
            | Bvlc::ReadBroadcastDistributionTableAck(entries) => {
                for entry in entries {
                    buf.put_slice(&entry.ip.octets());
                    buf.put_u16(entry.port);
                    buf.put_slice(&entry.mask.octets());
                }
            }
            Bvlc::ReadBroadcastDistributionTable | Bvlc::ReadForeignDeviceTable => {}
            Bvlc::ForwardedNpdu { origin, npdu } => {
                put_socket_addr(&mut buf, origin);
                buf.put_slice(npdu);
            }
            Bvlc::RegisterForeignDevice { ttl } => buf.put_u16(*ttl),
            Bvlc::ReadForeignDeviceTableAck(entries) => {
                for entry in entries {
                    put_socket_addr(&mut buf, &entry.address);
                    buf.put_u16(entry.ttl);
                    buf.put_u16(entry.remaining.min(u32::from(u16::MAX)) as u16);
                }
            }
            Bvlc::DeleteForeignDeviceTableEntry { address } => put_socket_addr(&mut buf, address),
            Bvlc::DistributeBroadcastToNetwork { npdu }
            | Bvlc::OriginalUnicastNpdu { npdu }
            | Bvlc::OriginalBroadcastNpdu { npdu } => buf.put_slice(npdu),
        }

        buf.freeze()
    }

    /// Parse a complete frame into a typed message.
    pub fn decode(mut frame: Bytes) -> Result<Bvlc> {
        let total = frame.len();
        if total < BVLL_HEADER_SIZE {
            return Err(CodecError::Truncated);
        }

        let bvll_type = frame.get_u8();
        if bvll_type != BVLL_TYPE_BACNET_IP {
            return Err(CodecError::InvalidBvllType(bvll_type));
        }

        let function_octet = frame.get_u8();
        let function = BvlcFunction::from_u8(function_octet)
            .ok_or(CodecError::UnknownFunction(function_octet))?;

        let declared = frame.get_u16();
        if usize::from(declared) != total {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: total,
            });
        }

        let body_len = frame.remaining();
        let invalid_body = || CodecError::InvalidBody {
            function,
            length: body_len,
        };

        match function {
            BvlcFunction::Result => {
                if body_len != 2 {
                    return Err(invalid_body());
                }
                let raw = frame.get_u16();
                let code = ResultCode::from_u16(raw).ok_or(CodecError::UnknownResultCode(raw))?;
                Ok(Bvlc::Result(code))
            }
            BvlcFunction::WriteBroadcastDistributionTable
            | BvlcFunction::ReadBroadcastDistributionTableAck => {
                if body_len % BDT_ENTRY_SIZE != 0 {
                    return Err(invalid_body());
                }
                let mut entries = Vec::with_capacity(body_len / BDT_ENTRY_SIZE);
                while frame.has_remaining() {
                    let ip = Ipv4Addr::from(frame.get_u32());
                    let port = frame.get_u16();
                    let mask = Ipv4Addr::from(frame.get_u32());
                    entries.push(BipAddr::with_mask(ip, mask, port));
                }
                match function {
                    BvlcFunction::WriteBroadcastDistributionTable => {
                        Ok(Bvlc::WriteBroadcastDistributionTable(entries))
                    }
                    _ => Ok(Bvlc::ReadBroadcastDistributionTableAck(entries)),
                }
            }
            BvlcFunction::ReadBroadcastDistributionTable => {
                if body_len != 0 {
                    return Err(invalid_body());
                }
                Ok(Bvlc::ReadBroadcastDistributionTable)
            }
            BvlcFunction::ForwardedNpdu => {
                if body_len < 6 {
                    return Err(invalid_body());
                }
                let origin = get_socket_addr(&mut frame);
                let npdu = frame.copy_to_bytes(frame.remaining());
                Ok(Bvlc::ForwardedNpdu { origin, npdu })
            }
            BvlcFunction::RegisterForeignDevice => {
                if body_len != 2 {
                    return Err(invalid_body());
                }
                Ok(Bvlc::RegisterForeignDevice {
                    ttl: frame.get_u16(),
                })
            }
            BvlcFunction::ReadForeignDeviceTable => {
                if body_len != 0 {
                    return Err(invalid_body());
                }
                Ok(Bvlc::ReadForeignDeviceTable)
            }
            BvlcFunction::ReadForeignDeviceTableAck => {
                if body_len % FDT_ENTRY_SIZE != 0 {
                    return Err(invalid_body());
                }
                let mut entries = Vec::with_capacity(body_len / FDT_ENTRY_SIZE);
                while frame.has_remaining() {
                    let address = get_socket_addr(&mut frame);
                    let ttl = frame.get_u16();
                    let remaining = u32::from(frame.get_u16());
                    entries.push(FdtEntry {
                        address,
                        ttl,
                        remaining,
                    });
                }
                Ok(Bvlc::ReadForeignDeviceTableAck(entries))
            }
            BvlcFunction::DeleteForeignDeviceTableEntry => {
                if body_len != 6 {
                    return Err(invalid_body());
                }
                Ok(Bvlc::DeleteForeignDeviceTableEntry {
                    address: get_socket_addr(&mut frame),
                })
            }
            BvlcFunction::DistributeBroadcastToNetwork => Ok(Bvlc::DistributeBroadcastToNetwork {
                npdu: frame.copy_to_bytes(frame.remaining()),
            }),
            BvlcFunction::OriginalUnicastNpdu => Ok(Bvlc::OriginalUnicastNpdu {
                npdu: frame.copy_to_bytes(frame.remaining()),
            }),
            BvlcFunction::OriginalBroadcastNpdu => Ok(Bvlc::OriginalBroadcastNpdu {
                npdu: frame.copy_to_bytes(frame.remaining()),
            }),
        }
    }
}

fn put_socket_addr(buf: &mut BytesMut, addr: &SocketAddrV4) {
    buf.put_slice(&addr.ip().octets());
    buf.put_u16(addr.port());
}

fn get_socket_addr(buf: &mut Bytes) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(buf.get_u32());
    let port = buf.get_u16();
    SocketAddrV4::new(ip, port)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn station(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn test_header_layout() {
        let frame = Bvlc::OriginalUnicastNpdu {
            npdu: Bytes::from_static(&[0x01, 0x02]),
        }
        .encode();

        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 0x0A);
        assert_eq!(frame[2], 0x00);
        assert_eq!(frame[3], 0x06);
        assert_eq!(&frame[4..], &[0x01, 0x02]);
    }

    #[test]
    fn test_forwarded_npdu_round_trip() {
        let message = Bvlc::ForwardedNpdu {
            origin: station("203.0.113.9:47808"),
            npdu: Bytes::from_static(&[0x01, 0x20, 0xFF]),
        };
        let frame = message.encode();
        assert_eq!(frame.len(), 13);
        assert_eq!(Bvlc::decode(frame).unwrap(), message);
    }

    #[test]
    fn test_table_messages_round_trip() {
        let bdt = vec![
            "192.168.0.2/24:47808".parse().unwrap(),
            "10.0.7.1/16:47809".parse().unwrap(),
        ];
        for message in [
            Bvlc::WriteBroadcastDistributionTable(bdt.clone()),
            Bvlc::ReadBroadcastDistributionTableAck(bdt),
            Bvlc::ReadBroadcastDistributionTable,
            Bvlc::ReadForeignDeviceTable,
            Bvlc::ReadForeignDeviceTableAck(vec![FdtEntry {
                address: station("203.0.113.9:47808"),
                ttl: 30,
                remaining: 35,
            }]),
            Bvlc::DeleteForeignDeviceTableEntry {
                address: station("203.0.113.9:47808"),
            },
        ] {
            assert_eq!(Bvlc::decode(message.encode()).unwrap(), message);
        }
    }

    #[test]
    fn test_empty_ack_has_header_only() {
        let frame = Bvlc::ReadForeignDeviceTableAck(Vec::new()).encode();
        assert_eq!(frame.as_ref(), &[0x81, 0x07, 0x00, 0x04]);
    }

    #[test]
    fn test_fdt_remaining_clamped_on_wire() {
        let message = Bvlc::ReadForeignDeviceTableAck(vec![FdtEntry {
            address: station("203.0.113.9:47808"),
            ttl: u16::MAX,
            remaining: u32::from(u16::MAX) + 5,
        }]);
        let decoded = Bvlc::decode(message.encode()).unwrap();
        match decoded {
            Bvlc::ReadForeignDeviceTableAck(entries) => {
                assert_eq!(entries[0].remaining, u32::from(u16::MAX));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        // too short for a header
        assert_eq!(
            Bvlc::decode(Bytes::from_static(&[0x81, 0x00])),
            Err(CodecError::Truncated)
        );

        // wrong BVLL type
        assert_eq!(
            Bvlc::decode(Bytes::from_static(&[0x82, 0x00, 0x00, 0x04])),
            Err(CodecError::InvalidBvllType(0x82))
        );

        // unknown function
        assert_eq!(
            Bvlc::decode(Bytes::from_static(&[0x81, 0x7F, 0x00, 0x04])),
            Err(CodecError::UnknownFunction(0x7F))
        );

        // declared length disagrees with the frame
        assert_eq!(
            Bvlc::decode(Bytes::from_static(&[0x81, 0x02, 0x00, 0x05])),
            Err(CodecError::LengthMismatch {
                declared: 5,
                actual: 4
            })
        );

        // register body must be exactly two octets
        assert!(matches!(
            Bvlc::decode(Bytes::from_static(&[0x81, 0x05, 0x00, 0x05, 0x1E])),
            Err(CodecError::InvalidBody { .. })
        ));

        // BDT body must be a whole number of entries
        assert!(matches!(
            Bvlc::decode(Bytes::from_static(&[0x81, 0x01, 0x00, 0x07, 1, 2, 3])),
            Err(CodecError::InvalidBody { .. })
        ));

        // unknown result code
        assert_eq!(
            Bvlc::decode(Bytes::from_static(&[0x81, 0x00, 0x00, 0x06, 0x00, 0x11])),
            Err(CodecError::UnknownResultCode(0x0011))
        );
    }

    #[test]
    fn test_all_result_codes_round_trip() {
        for code in [
            ResultCode::Success,
            ResultCode::WriteBdtNak,
            ResultCode::ReadBdtNak,
            ResultCode::RegisterForeignDeviceNak,
            ResultCode::ReadFdtNak,
            ResultCode::DeleteFdtEntryNak,
            ResultCode::DistributeBroadcastNak,
        ] {
            assert_eq!(
                Bvlc::decode(Bvlc::Result(code).encode()).unwrap(),
                Bvlc::Result(code)
            );
        }
    }

    proptest! {
        #[test]
        fn prop_npdu_messages_round_trip(
            variant in 0u8..4,
            npdu in proptest::collection::vec(any::<u8>(), 0..128),
            ip in any::<u32>(),
            port in any::<u16>(),
        ) {
            let npdu = Bytes::from(npdu);
            let message = match variant {
                0 => Bvlc::OriginalUnicastNpdu { npdu },
                1 => Bvlc::OriginalBroadcastNpdu { npdu },
                2 => Bvlc::DistributeBroadcastToNetwork { npdu },
                _ => Bvlc::ForwardedNpdu {
                    origin: SocketAddrV4::new(Ipv4Addr::from(ip), port),
                    npdu,
                },
            };
            prop_assert_eq!(Bvlc::decode(message.encode()).unwrap(), message);
        }
    }
}
