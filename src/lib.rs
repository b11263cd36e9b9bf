#![doc = include_str!("../README.md")]

pub mod bip;
pub mod bvlc;
pub mod comm;
pub mod pdu;
pub mod udp;

// Re-export main types without glob imports to avoid conflicts
pub use bip::{BipBbmd, BipForeign, BipSimple, RegistrationStatus};
pub use bvlc::{AnnexJCodec, Bvlc, BvlcFunction, CodecError, FdtEntry, ResultCode};
pub use comm::{bind, Binding, Client, CommError, Server};
pub use pdu::{Address, BipAddr, Pdu, BACNET_IP_PORT};
pub use udp::{DirectorConfig, DirectorObserver, UdpActor, UdpDirector, UdpMultiplexer};

#[cfg(test)]
mod tests {
    use crate::bvlc::{Bvlc, ResultCode, BVLL_HEADER_SIZE, MAX_BVLL_LENGTH};
    use crate::pdu::{BipAddr, BACNET_IP_PORT};

    #[test]
    fn test_constants() {
        assert_eq!(BACNET_IP_PORT, 0xBAC0);
        assert_eq!(BVLL_HEADER_SIZE, 4);
        assert_eq!(MAX_BVLL_LENGTH, 1497);
    }

    #[test]
    fn test_default_port_applied() {
        let addr: BipAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(addr.port, BACNET_IP_PORT);
    }

    #[test]
    fn test_result_frame_shape() {
        let frame = Bvlc::Result(ResultCode::WriteBdtNak).encode();
        assert_eq!(frame.as_ref(), &[0x81, 0x00, 0x00, 0x06, 0x00, 0x10]);
    }
}
