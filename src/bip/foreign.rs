//! Foreign device client.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use tokio::task::JoinHandle;

use super::{service_nak, FD_TIMEOUT_GRACE_SECS};
use crate::bvlc::{Bvlc, ResultCode};
use crate::comm::{Binding, Client, CommError, Result, Server};
use crate::pdu::{Address, BipAddr, Pdu};

/// Where a foreign device stands with its BBMD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// Not registered and not trying to be
    Unregistered,
    /// Registration sent, no acknowledgement yet
    Pending,
    /// The BBMD acknowledged the registration
    Registered,
    /// The BBMD refused the registration
    Rejected(ResultCode),
}

struct ForeignState {
    status: RegistrationStatus,
    bbmd: Option<BipAddr>,
    ttl: u16,
    // the generation counters invalidate a timer that fires after a rearm
    renewal_gen: u64,
    renewal_task: Option<JoinHandle<()>>,
    timeout_gen: u64,
    timeout_task: Option<JoinHandle<()>>,
}

/// A BACnet/IP node living outside the local broadcast domain.
///
/// Registers with a remote BBMD and renews the registration every TTL
/// seconds. Local broadcasts are redirected to the BBMD while the
/// registration is acknowledged and dropped otherwise. A registration that
/// goes unacknowledged past the grace window degrades back to
/// [`RegistrationStatus::Pending`].
pub struct BipForeign {
    upstream: Binding<dyn Client>,
    downstream: Binding<dyn Server>,
    state: Mutex<ForeignState>,
    me: Weak<BipForeign>,
}

impl BipForeign {
    /// Create a node ready to be bound into a stack.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            upstream: Binding::new(),
            downstream: Binding::new(),
            state: Mutex::new(ForeignState {
                status: RegistrationStatus::Unregistered,
                bbmd: None,
                ttl: 0,
                renewal_gen: 0,
                renewal_task: None,
                timeout_gen: 0,
                timeout_task: None,
            }),
            me: me.clone(),
        })
    }

    /// The current registration status.
    pub fn status(&self) -> RegistrationStatus {
        self.state.lock().unwrap().status
    }

    /// The BBMD this node is registered (or registering) with.
    pub fn bbmd_address(&self) -> Option<BipAddr> {
        self.state.lock().unwrap().bbmd
    }

    /// Start registering with `bbmd`, renewing every `ttl` seconds.
    ///
    /// The first registration request goes out immediately; renewals repeat
    /// on schedule whether or not the BBMD has answered. Must be called from
    /// within a tokio runtime.
    pub fn register(&self, bbmd: BipAddr, ttl: u16) -> Result<()> {
        if ttl == 0 {
            return Err(CommError::InvalidConfiguration(
                "registration time-to-live must be positive".into(),
            ));
        }

        let mut state = self.state.lock().unwrap();
        state.bbmd = Some(bbmd);
        state.ttl = ttl;
        state.status = RegistrationStatus::Pending;

        Self::arm_timeout(&mut state, &self.me, ttl);

        state.renewal_gen += 1;
        if let Some(task) = state.renewal_task.take() {
            task.abort();
        }
        let gen = state.renewal_gen;
        let me = self.me.clone();
        state.renewal_task = Some(tokio::spawn(async move {
            loop {
                let Some(this) = me.upgrade() else { return };
                let Some((bbmd, ttl)) = this.renewal_params(gen) else {
                    return;
                };
                this.send_registration(bbmd, ttl);
                drop(this);
                tokio::time::sleep(Duration::from_secs(u64::from(ttl))).await;
            }
        }));

        Ok(())
    }

    /// Drop the registration, telling the BBMD with a zero TTL.
    pub fn unregister(&self) -> Result<()> {
        let bbmd = {
            let mut state = self.state.lock().unwrap();
            let bbmd = state.bbmd.take();
            state.status = RegistrationStatus::Unregistered;
            state.ttl = 0;
            state.renewal_gen += 1;
            if let Some(task) = state.renewal_task.take() {
                task.abort();
            }
            state.timeout_gen += 1;
            if let Some(task) = state.timeout_task.take() {
                task.abort();
            }
            bbmd
        };

        if let Some(bbmd) = bbmd {
            // a zero TTL is the protocol's de-registration signal
            self.send_registration(bbmd, 0);
        }
        Ok(())
    }

    fn renewal_params(&self, gen: u64) -> Option<(BipAddr, u16)> {
        let state = self.state.lock().unwrap();
        if state.renewal_gen != gen {
            return None;
        }
        state.bbmd.map(|bbmd| (bbmd, state.ttl))
    }

    fn send_registration(&self, bbmd: BipAddr, ttl: u16) {
        let pdu = Pdu::new(Bytes::new())
            .with_bvlc(Bvlc::RegisterForeignDevice { ttl })
            .with_destination(Address::LocalStation(bbmd));
        if let Err(e) = self.request(pdu) {
            warn!("foreign device registration send failed: {e}");
        }
    }

    fn arm_timeout(state: &mut ForeignState, me: &Weak<Self>, ttl: u16) {
        state.timeout_gen += 1;
        if let Some(task) = state.timeout_task.take() {
            task.abort();
        }
        let gen = state.timeout_gen;
        let me = me.clone();
        state.timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(u64::from(ttl) + FD_TIMEOUT_GRACE_SECS)).await;
            let Some(this) = me.upgrade() else { return };
            let mut state = this.state.lock().unwrap();
            if state.timeout_gen != gen {
                // rearmed while this firing was pending
                return;
            }
            state.timeout_task = None;
            state.status = RegistrationStatus::Pending;
            debug!("foreign device registration unacknowledged past grace window");
        }));
    }

    fn handle_result(&self, pdu: &Pdu, code: ResultCode) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.status == RegistrationStatus::Unregistered {
            // mid-unregister, the answer no longer matters
            return Ok(());
        }
        let Some(bbmd) = state.bbmd else {
            return Ok(());
        };
        if pdu.source_socket() != Some(bbmd.socket_addr()) {
            debug!("ignoring Result from {:?}", pdu.source);
            return Ok(());
        }

        if code.is_success() {
            state.status = RegistrationStatus::Registered;
            let ttl = state.ttl;
            Self::arm_timeout(&mut state, &self.me, ttl);
        } else {
            state.status = RegistrationStatus::Rejected(code);
        }
        Ok(())
    }

    fn from_registered_bbmd(&self, pdu: &Pdu) -> bool {
        let state = self.state.lock().unwrap();
        state.status == RegistrationStatus::Registered
            && state
                .bbmd
                .map(|bbmd| pdu.source_socket() == Some(bbmd.socket_addr()))
                .unwrap_or(false)
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

impl Drop for BipForeign {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.renewal_task.take() {
            task.abort();
        }
        if let Some(task) = state.timeout_task.take() {
            task.abort();
        }
    }
}

impl Server for BipForeign {
    fn indication(&self, pdu: Pdu) -> Result<()> {
        match pdu.destination {
            Some(Address::LocalStation(_)) => {
                let message = Bvlc::OriginalUnicastNpdu {
                    npdu: pdu.payload.clone(),
                };
                self.request(Pdu::derived_from(&pdu, Bytes::new()).with_bvlc(message))
            }
            Some(Address::LocalBroadcast) => {
                let bbmd = {
                    let state = self.state.lock().unwrap();
                    match (state.status, state.bbmd) {
                        (RegistrationStatus::Registered, Some(bbmd)) => bbmd,
                        _ => {
                            debug!("not registered, dropping local broadcast");
                            return Ok(());
                        }
                    }
                };
                // the BBMD broadcasts on this node's behalf
                let message = Bvlc::OriginalBroadcastNpdu {
                    npdu: pdu.payload.clone(),
                };
                self.request(
                    Pdu::derived_from(&pdu, Bytes::new())
                        .with_bvlc(message)
                        .with_destination(Address::LocalStation(bbmd)),
                )
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

impl Client for BipForeign {
    fn confirmation(&self, pdu: Pdu) -> Result<()> {
        let Some(message) = pdu.bvlc.clone() else {
            debug!("dropping frame without a decoded BVLC message");
            return Ok(());
        };

        match message {
            Bvlc::Result(code) => self.handle_result(&pdu, code),
            Bvlc::ReadBroadcastDistributionTableAck(_) | Bvlc::ReadForeignDeviceTableAck(_) => {
                self.response(pdu)
            }
            Bvlc::OriginalUnicastNpdu { npdu } => {
                if !self.from_registered_bbmd(&pdu) {
                    return Ok(());
                }
                self.response(Pdu::derived_from(&pdu, npdu))
            }
            Bvlc::ForwardedNpdu { origin, npdu } => {
                if !self.from_registered_bbmd(&pdu) {
                    return Ok(());
                }
                self.response(
                    Pdu::derived_from(&pdu, npdu)
                        .with_source(origin.into())
                        .with_destination(Address::LocalBroadcast),
                )
            }
            Bvlc::OriginalBroadcastNpdu { .. } => {
                debug!("foreign device ignoring local broadcast frame");
                Ok(())
            }
            other => match service_nak(&other) {
                Some(code) => self.reply_nak(&pdu, code),
                None => {
                    debug!("foreign device ignoring {}", other.function());
                    Ok(())
                }
            },
        }
    }

    fn downstream(&self) -> &Binding<dyn Server> {
        &self.downstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::testing::{CapturingClient, CapturingServer};
    use crate::comm::bind;

    fn stack() -> (Arc<CapturingClient>, Arc<BipForeign>, Arc<CapturingServer>) {
        let upper = CapturingClient::new();
        let node = BipForeign::new();
        let lower = CapturingServer::new();
        bind(&upper, &node).unwrap();
        bind(&node, &lower).unwrap();
        (upper, node, lower)
    }

    fn bbmd_addr() -> BipAddr {
        "10.1.0.1:47808".parse().unwrap()
    }

    fn result_from_bbmd(code: ResultCode) -> Pdu {
        Pdu::new(Bytes::new())
            .with_bvlc(Bvlc::Result(code))
            .with_source(Address::LocalStation(bbmd_addr()))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_register_rejects_zero_ttl() {
        let (_, node, _) = stack();
        assert!(matches!(
            node.register(bbmd_addr(), 0),
            Err(CommError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_sent_immediately_and_renewed() {
        let (_, node, lower) = stack();
        node.register(bbmd_addr(), 10).unwrap();
        settle().await;

        let sent = lower.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bvlc, Some(Bvlc::RegisterForeignDevice { ttl: 10 }));
        assert_eq!(sent[0].destination, Some(Address::LocalStation(bbmd_addr())));
        assert_eq!(node.status(), RegistrationStatus::Pending);

        // renewals repeat every TTL seconds, acknowledged or not
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(lower.take().len(), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(lower.take().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_codes_update_status() {
        let (_, node, _) = stack();
        node.register(bbmd_addr(), 60).unwrap();
        settle().await;

        node.confirmation(result_from_bbmd(ResultCode::RegisterForeignDeviceNak))
            .unwrap();
        assert_eq!(
            node.status(),
            RegistrationStatus::Rejected(ResultCode::RegisterForeignDeviceNak)
        );

        node.confirmation(result_from_bbmd(ResultCode::Success)).unwrap();
        assert_eq!(node.status(), RegistrationStatus::Registered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_from_stranger_ignored() {
        let (_, node, _) = stack();
        node.register(bbmd_addr(), 60).unwrap();
        settle().await;

        node.confirmation(
            Pdu::new(Bytes::new())
                .with_bvlc(Bvlc::Result(ResultCode::Success))
                .with_source(Address::LocalStation("192.0.2.200:47808".parse().unwrap())),
        )
        .unwrap();
        assert_eq!(node.status(), RegistrationStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_registration_degrades() {
        let (_, node, _) = stack();
        node.register(bbmd_addr(), 60).unwrap();
        settle().await;
        node.confirmation(result_from_bbmd(ResultCode::Success)).unwrap();
        assert_eq!(node.status(), RegistrationStatus::Registered);

        // the grace window is TTL + 30 seconds after the acknowledgement
        tokio::time::sleep(Duration::from_secs(89)).await;
        settle().await;
        assert_eq!(node.status(), RegistrationStatus::Registered);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(node.status(), RegistrationStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledgement_rearms_grace_window() {
        let (_, node, _) = stack();
        node.register(bbmd_addr(), 60).unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        node.confirmation(result_from_bbmd(ResultCode::Success)).unwrap();

        // the stale firing scheduled at registration time must not demote
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(node.status(), RegistrationStatus::Registered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_sends_zero_ttl() {
        let (_, node, lower) = stack();
        node.register(bbmd_addr(), 30).unwrap();
        settle().await;
        node.confirmation(result_from_bbmd(ResultCode::Success)).unwrap();
        lower.take();

        node.unregister().unwrap();
        let sent = lower.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bvlc, Some(Bvlc::RegisterForeignDevice { ttl: 0 }));
        assert_eq!(node.status(), RegistrationStatus::Unregistered);
        assert_eq!(node.bbmd_address(), None);

        // a late Result must not resurrect the registration
        node.confirmation(
            Pdu::new(Bytes::new())
                .with_bvlc(Bvlc::Result(ResultCode::Success))
                .with_source(Address::LocalStation(bbmd_addr())),
        )
        .unwrap();
        assert_eq!(node.status(), RegistrationStatus::Unregistered);

        // renewals stop
        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(lower.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_redirected_to_bbmd_when_registered() {
        let (_, node, lower) = stack();
        node.register(bbmd_addr(), 30).unwrap();
        settle().await;
        lower.take();

        // unacknowledged: dropped, not an error
        node.indication(Pdu::new(vec![0x01]).with_destination(Address::LocalBroadcast))
            .unwrap();
        assert_eq!(lower.len(), 0);

        node.confirmation(result_from_bbmd(ResultCode::Success)).unwrap();
        node.indication(Pdu::new(vec![0x01]).with_destination(Address::LocalBroadcast))
            .unwrap();

        let sent = lower.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].bvlc,
            Some(Bvlc::OriginalBroadcastNpdu {
                npdu: Bytes::from_static(&[0x01])
            })
        );
        assert_eq!(sent[0].destination, Some(Address::LocalStation(bbmd_addr())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_gated_on_registration_and_source() {
        let (upper, node, _) = stack();
        let forwarded = Pdu::new(Bytes::new())
            .with_bvlc(Bvlc::ForwardedNpdu {
                origin: "203.0.113.9:47808".parse().unwrap(),
                npdu: Bytes::from_static(&[0x07]),
            })
            .with_source(Address::LocalStation(bbmd_addr()));

        // not registered yet: dropped silently
        node.confirmation(forwarded.clone()).unwrap();
        assert_eq!(upper.len(), 0);

        node.register(bbmd_addr(), 30).unwrap();
        settle().await;
        node.confirmation(result_from_bbmd(ResultCode::Success)).unwrap();

        // wrong source: dropped silently
        node.confirmation(
            forwarded
                .clone()
                .with_source(Address::LocalStation("192.0.2.200:47808".parse().unwrap())),
        )
        .unwrap();
        assert_eq!(upper.len(), 0);

        node.confirmation(forwarded).unwrap();
        let received = upper.take();
        assert_eq!(received.len(), 1);
        assert_eq!(
            received[0].source,
            Some(Address::LocalStation("203.0.113.9:47808".parse().unwrap()))
        );
        assert_eq!(received[0].destination, Some(Address::LocalBroadcast));
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_requests_naked() {
        let (_, node, lower) = stack();
        let source = Address::LocalStation("192.0.2.7:47808".parse().unwrap());

        node.confirmation(
            Pdu::new(Bytes::new())
                .with_bvlc(Bvlc::ReadForeignDeviceTable)
                .with_source(source),
        )
        .unwrap();

        let sent = lower.take();
        assert_eq!(sent[0].bvlc, Some(Bvlc::Result(ResultCode::ReadFdtNak)));
        assert_eq!(sent[0].destination, Some(source));
    }
}
