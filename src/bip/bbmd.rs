//! Broadcast management device.

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use log::{debug, warn};
use tokio::task::JoinHandle;

use super::{FDT_EXPIRY_INTERVAL, FD_REGISTRATION_GRACE_SECS};
use crate::bvlc::{Bvlc, FdtEntry, ResultCode};
use crate::comm::{Binding, Client, CommError, Result, Server};
use crate::pdu::{Address, BipAddr, Pdu};

#[derive(Default)]
struct Tables {
    bdt: Vec<BipAddr>,
    fdt: Vec<FdtEntry>,
}

/// A BACnet broadcast management device.
///
/// Relays local broadcasts to the peer BBMDs in its broadcast distribution
/// table and to its registered foreign devices, and serves the table
/// read/registration requests of Annex J. Writes to the broadcast
/// distribution table over the wire are refused; peers are managed with
/// [`add_peer`](Self::add_peer) and [`delete_peer`](Self::delete_peer).
///
/// Both tables live behind one lock: timer ticks, inbound frames, and
/// outbound requests all mutate them through that single serialization
/// point, and fan-out sends happen on snapshots taken under it.
pub struct BipBbmd {
    address: BipAddr,
    upstream: Binding<dyn Client>,
    downstream: Binding<dyn Server>,
    tables: Mutex<Tables>,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
}

impl BipBbmd {
    /// Create a BBMD answering for `address`.
    ///
    /// The address mask is the local subnet's; peers direct their broadcasts
    /// at it. Call [`start`](Self::start) to run the registration expiry
    /// task.
    pub fn new(address: BipAddr) -> Arc<Self> {
        Arc::new(Self {
            address,
            upstream: Binding::new(),
            downstream: Binding::new(),
            tables: Mutex::new(Tables::default()),
            expiry_task: Mutex::new(None),
        })
    }

    /// This BBMD's own address.
    pub fn address(&self) -> BipAddr {
        self.address
    }

    /// Run the once-a-second foreign device expiry task until
    /// [`stop`](Self::stop) or drop. Must be called from within a tokio
    /// runtime.
    pub fn start(self: &Arc<Self>) {
        let me = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(FDT_EXPIRY_INTERVAL).await;
                let Some(this) = me.upgrade() else { return };
                this.age_foreign_devices();
            }
        });
        if let Some(old) = self.expiry_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    /// Stop the expiry task.
    pub fn stop(&self) {
        if let Some(task) = self.expiry_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Add a peer BBMD to the broadcast distribution table.
    ///
    /// Adding an address that is already present is a no-op.
    pub fn add_peer(&self, peer: BipAddr) {
        let mut tables = self.tables.lock().unwrap();
        if !tables.bdt.contains(&peer) {
            tables.bdt.push(peer);
        }
    }

    /// Remove a peer BBMD from the broadcast distribution table.
    ///
    /// Removing an absent address is a no-op.
    pub fn delete_peer(&self, peer: BipAddr) {
        self.tables.lock().unwrap().bdt.retain(|entry| *entry != peer);
    }

    /// The current broadcast distribution table.
    pub fn bdt(&self) -> Vec<BipAddr> {
        self.tables.lock().unwrap().bdt.clone()
    }

    /// The current foreign device table.
    pub fn fdt(&self) -> Vec<FdtEntry> {
        self.tables.lock().unwrap().fdt.clone()
    }

    /// Accept a foreign device registration.
    ///
    /// Registering an address that is already present refreshes its TTL in
    /// place. Registration always succeeds, the table has no capacity limit.
    pub fn register_foreign_device(&self, address: SocketAddrV4, ttl: u16) -> ResultCode {
        let remaining = u32::from(ttl) + FD_REGISTRATION_GRACE_SECS;
        let mut tables = self.tables.lock().unwrap();
        match tables.fdt.iter_mut().find(|entry| entry.address == address) {
            Some(entry) => {
                entry.ttl = ttl;
                entry.remaining = remaining;
            }
            None => tables.fdt.push(FdtEntry {
                address,
                ttl,
                remaining,
            }),
        }
        ResultCode::Success
    }

    /// Remove a foreign device registration.
    pub fn delete_foreign_device(&self, address: SocketAddrV4) -> ResultCode {
        let mut tables = self.tables.lock().unwrap();
        match tables.fdt.iter().position(|entry| entry.address == address) {
            Some(index) => {
                tables.fdt.remove(index);
                ResultCode::Success
            }
            None => ResultCode::DeleteFdtEntryNak,
        }
    }

    /// One expiry tick: count every registration down a second and drop the
    /// ones that reach zero. The expired peer is not notified.
    pub fn age_foreign_devices(&self) {
        let mut tables = self.tables.lock().unwrap();
        for entry in &mut tables.fdt {
            entry.remaining = entry.remaining.saturating_sub(1);
        }
        tables.fdt.retain(|entry| {
            if entry.remaining == 0 {
                debug!("foreign device registration expired: {}", entry.address);
                false
            } else {
                true
            }
        });
    }

    fn snapshot(&self) -> (Vec<BipAddr>, Vec<FdtEntry>) {
        let tables = self.tables.lock().unwrap();
        (tables.bdt.clone(), tables.fdt.clone())
    }

    fn listed_in_own_bdt(&self) -> bool {
        self.tables.lock().unwrap().bdt.contains(&self.address)
    }

    /// Send one relay leg, reporting a failure without aborting the fan-out.
    fn relay(&self, pdu: &Pdu, message: &Bvlc, destination: Address) {
        let out = Pdu {
            payload: Bytes::new(),
            source: None,
            destination: Some(destination),
            user_data: pdu.user_data.clone(),
            bvlc: Some(message.clone()),
        };
        if let Err(e) = self.request(out) {
            warn!("relay to {destination} failed: {e}");
        }
    }

    fn reply(&self, pdu: &Pdu, message: Bvlc) -> Result<()> {
        let Some(source) = pdu.source else {
            warn!("cannot answer a request without a source address");
            return Ok(());
        };
        self.request(
            Pdu::new(Bytes::new())
                .with_bvlc(message)
                .with_destination(source),
        )
    }
}

impl Drop for BipBbmd {
    fn drop(&mut self) {
        if let Some(task) = self.expiry_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Server for BipBbmd {
    fn indication(&self, pdu: Pdu) -> Result<()> {
        match pdu.destination {
            Some(Address::LocalStation(_)) => {
                let message = Bvlc::OriginalUnicastNpdu {
                    npdu: pdu.payload.clone(),
                };
                self.request(Pdu::derived_from(&pdu, Bytes::new()).with_bvlc(message))
            }
            Some(Address::LocalBroadcast) => {
                // broadcast on the local subnet, then relay to every other
                // BBMD's subnet and every registered foreign device
                let original = Bvlc::OriginalBroadcastNpdu {
                    npdu: pdu.payload.clone(),
                };
                self.relay(&pdu, &original, Address::LocalBroadcast);

                let forwarded = Bvlc::ForwardedNpdu {
                    origin: self.address.socket_addr(),
                    npdu: pdu.payload.clone(),
                };
                let (bdt, fdt) = self.snapshot();
                for peer in bdt.iter().filter(|peer| **peer != self.address) {
                    self.relay(&pdu, &forwarded, Address::LocalStation(peer.broadcast().into()));
                }
                for entry in &fdt {
                    self.relay(&pdu, &forwarded, entry.address.into());
                }
                Ok(())
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

impl Client for BipBbmd {
    fn confirmation(&self, pdu: Pdu) -> Result<()> {
        let Some(message) = pdu.bvlc.clone() else {
            return Err(CommError::UnexpectedBvlc(
                "frame without a decoded BVLC message".into(),
            ));
        };

        match message {
            Bvlc::Result(_)
            | Bvlc::ReadBroadcastDistributionTableAck(_)
            | Bvlc::ReadForeignDeviceTableAck(_) => self.response(pdu),

            // table writes over the wire stay disabled
            Bvlc::WriteBroadcastDistributionTable(_) => {
                self.reply(&pdu, Bvlc::Result(ResultCode::WriteBdtNak))
            }
            Bvlc::ReadBroadcastDistributionTable => {
                self.reply(&pdu, Bvlc::ReadBroadcastDistributionTableAck(self.bdt()))
            }
            Bvlc::ReadForeignDeviceTable => {
                self.reply(&pdu, Bvlc::ReadForeignDeviceTableAck(self.fdt()))
            }
            Bvlc::RegisterForeignDevice { ttl } => {
                let Some(source) = pdu.source_socket() else {
                    warn!("dropping registration without a station source");
                    return Ok(());
                };
                let code = self.register_foreign_device(source, ttl);
                self.reply(&pdu, Bvlc::Result(code))
            }
            Bvlc::DeleteForeignDeviceTableEntry { address } => {
                let code = self.delete_foreign_device(address);
                self.reply(&pdu, Bvlc::Result(code))
            }

            Bvlc::ForwardedNpdu { origin, npdu } => {
                if self.upstream.is_bound() {
                    return self.response(
                        Pdu::derived_from(&pdu, npdu)
                            .with_source(origin.into())
                            .with_destination(Address::LocalBroadcast),
                    );
                }
                let forwarded = Bvlc::ForwardedNpdu { origin, npdu };
                if self.listed_in_own_bdt() {
                    self.relay(&pdu, &forwarded, Address::LocalBroadcast);
                }
                let (_, fdt) = self.snapshot();
                for entry in &fdt {
                    self.relay(&pdu, &forwarded, entry.address.into());
                }
                Ok(())
            }

            Bvlc::DistributeBroadcastToNetwork { npdu } => {
                let Some(source) = pdu.source_socket() else {
                    warn!("dropping broadcast distribution without a station source");
                    return Ok(());
                };
                if self.upstream.is_bound() {
                    return self.response(
                        Pdu::derived_from(&pdu, npdu).with_destination(Address::LocalBroadcast),
                    );
                }
                let forwarded = Bvlc::ForwardedNpdu {
                    origin: source,
                    npdu,
                };
                if self.listed_in_own_bdt() {
                    self.relay(&pdu, &forwarded, Address::LocalBroadcast);
                }
                let (bdt, fdt) = self.snapshot();
                for peer in bdt.iter().filter(|peer| **peer != self.address) {
                    self.relay(&pdu, &forwarded, Address::LocalStation(peer.broadcast().into()));
                }
                // every foreign device except the one distributing
                for entry in fdt.iter().filter(|entry| entry.address != source) {
                    self.relay(&pdu, &forwarded, entry.address.into());
                }
                Ok(())
            }

            Bvlc::OriginalUnicastNpdu { npdu } => {
                if self.upstream.is_bound() {
                    self.response(Pdu::derived_from(&pdu, npdu))
                } else {
                    debug!("no network layer bound, dropping unicast NPDU");
                    Ok(())
                }
            }

            Bvlc::OriginalBroadcastNpdu { npdu } => {
                let Some(source) = pdu.source_socket() else {
                    warn!("dropping local broadcast without a station source");
                    return Ok(());
                };
                if self.upstream.is_bound() {
                    self.response(
                        Pdu::derived_from(&pdu, npdu.clone())
                            .with_destination(Address::LocalBroadcast),
                    )?;
                }
                // a local broadcast always continues to the other subnets
                // and the registered foreign devices
                let forwarded = Bvlc::ForwardedNpdu {
                    origin: source,
                    npdu,
                };
                let (bdt, fdt) = self.snapshot();
                for peer in bdt.iter().filter(|peer| **peer != self.address) {
                    self.relay(&pdu, &forwarded, Address::LocalStation(peer.broadcast().into()));
                }
                for entry in &fdt {
                    self.relay(&pdu, &forwarded, entry.address.into());
                }
                Ok(())
            }
        }
    }

    fn downstream(&self) -> &Binding<dyn Server> {
        &self.downstream
    }
}
