//! BACnet/IP Node Personalities
//!
//! A BACnet/IP node speaks one of three roles on its subnet:
//!
//! - [`BipSimple`]: a plain node that translates between NPDUs and the
//!   original unicast/broadcast BVLC wrappers.
//! - [`BipForeign`]: a node outside the broadcast domain that registers with
//!   a remote BBMD and keeps the registration alive.
//! - [`BipBbmd`]: a broadcast management device that relays broadcasts
//!   between subnets through its broadcast distribution table and serves
//!   foreign device registrations.
//!
//! All three implement both sides of the layer contract: a network layer is
//! bound above them and the Annex J codec below them.

mod bbmd;
mod foreign;
mod simple;

pub use bbmd::BipBbmd;
pub use foreign::{BipForeign, RegistrationStatus};
pub use simple::BipSimple;

use std::time::Duration;

use crate::bvlc::{Bvlc, ResultCode};

/// Grace seconds added to a foreign device's TTL before its table entry
/// expires, covering network delay on the renewal.
pub const FD_REGISTRATION_GRACE_SECS: u32 = 5;

/// Grace seconds past the TTL a foreign device waits for a registration
/// acknowledgement before treating the registration as dead.
pub const FD_TIMEOUT_GRACE_SECS: u64 = 30;

/// Interval of the BBMD's foreign device table expiry task.
pub const FDT_EXPIRY_INTERVAL: Duration = Duration::from_secs(1);

/// The NAK a node replies with when it does not serve a table request.
///
/// `None` for messages that are not table service requests.
pub(crate) fn service_nak(message: &Bvlc) -> Option<ResultCode> {
    Some(match message {
        Bvlc::WriteBroadcastDistributionTable(_) => ResultCode::WriteBdtNak,
        Bvlc::ReadBroadcastDistributionTable => ResultCode::ReadBdtNak,
        Bvlc::RegisterForeignDevice { .. } => ResultCode::RegisterForeignDeviceNak,
        Bvlc::ReadForeignDeviceTable => ResultCode::ReadFdtNak,
        Bvlc::DeleteForeignDeviceTableEntry { .. } => ResultCode::DeleteFdtEntryNak,
        Bvlc::DistributeBroadcastToNetwork { .. } => ResultCode::DistributeBroadcastNak,
        _ => return None,
    })
}
