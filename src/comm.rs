//! Layer Wiring Primitives
//!
//! The protocol stack is assembled from layers that talk to each other
//! through two small traits. A [`Client`] sits above a [`Server`]: requests
//! flow down from the client as indications to the server, responses flow
//! back up as confirmations to the client. A layer in the middle of a stack
//! implements both traits.
//!
//! Peers are connected once, at construction time, with [`bind`]. Each side
//! holds the other in a write-once [`Binding`] slot, so the wiring is
//! explicit in the code that builds the stack and a second bind of the same
//! slot is a configuration error. Calls through a binding are synchronous
//! direct calls; any queueing happens inside the layers themselves.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use bacnet_bvll::comm::{bind, Binding, Client, CommError, Server};
//! use bacnet_bvll::pdu::Pdu;
//!
//! struct Echo {
//!     upstream: Binding<dyn Client>,
//! }
//!
//! impl Server for Echo {
//!     fn indication(&self, pdu: Pdu) -> Result<(), CommError> {
//!         self.response(pdu)
//!     }
//!
//!     fn upstream(&self) -> &Binding<dyn Client> {
//!         &self.upstream
//!     }
//! }
//!
//! struct Sink {
//!     downstream: Binding<dyn Server>,
//! }
//!
//! impl Client for Sink {
//!     fn confirmation(&self, _pdu: Pdu) -> Result<(), CommError> {
//!         Ok(())
//!     }
//!
//!     fn downstream(&self) -> &Binding<dyn Server> {
//!         &self.downstream
//!     }
//! }
//!
//! let sink = Arc::new(Sink { downstream: Binding::new() });
//! let echo = Arc::new(Echo { upstream: Binding::new() });
//! bind(&sink, &echo).unwrap();
//! sink.request(Pdu::new(vec![0x01])).unwrap();
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::bvlc::CodecError;
use crate::pdu::Pdu;

/// Result type for layer operations
pub type Result<T> = std::result::Result<T, CommError>;

/// Errors that can occur while wiring or running a protocol stack
#[derive(Debug, Error)]
pub enum CommError {
    /// I/O error from the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Wire encoding or decoding failure
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Destination of a kind this layer cannot route
    #[error("address not routable: {0}")]
    InvalidAddress(String),
    /// A BVLC message this node's role does not expect
    #[error("unexpected BVLC message: {0}")]
    UnexpectedBvlc(String),
    /// Bad construction or registration arguments
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The peer slot is already bound
    #[error("layer peer already bound")]
    AlreadyBound,
    /// The peer slot has not been bound
    #[error("layer peer not bound")]
    NotBound,
}

/// A write-once slot holding a reference to a peer layer.
///
/// Binding twice fails with [`CommError::AlreadyBound`]; using an unbound
/// slot fails with [`CommError::NotBound`].
pub struct Binding<T: ?Sized> {
    slot: OnceLock<Arc<T>>,
}

impl<T: ?Sized> Binding<T> {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self {
            slot: OnceLock::new(),
        }
    }

    /// Store the peer reference. Fails if a peer is already bound.
    pub fn bind(&self, peer: Arc<T>) -> Result<()> {
        self.slot.set(peer).map_err(|_| CommError::AlreadyBound)
    }

    /// The bound peer, or [`CommError::NotBound`].
    pub fn get(&self) -> Result<Arc<T>> {
        self.slot.get().cloned().ok_or(CommError::NotBound)
    }

    /// Whether a peer has been bound.
    pub fn is_bound(&self) -> bool {
        self.slot.get().is_some()
    }
}

impl<T: ?Sized> Default for Binding<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Binding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bound() {
            write!(f, "Binding(bound)")
        } else {
            write!(f, "Binding(unbound)")
        }
    }
}

/// The upper side of a layer boundary.
///
/// A client issues requests to the server below it and receives the
/// server's traffic back as confirmations.
pub trait Client: Send + Sync {
    /// Deliver a PDU coming up from the layer below.
    fn confirmation(&self, pdu: Pdu) -> Result<()>;

    /// The slot holding the server below this client.
    fn downstream(&self) -> &Binding<dyn Server>;

    /// Send a PDU down to the bound server.
    fn request(&self, pdu: Pdu) -> Result<()> {
        self.downstream().get()?.indication(pdu)
    }
}

/// The lower side of a layer boundary.
///
/// A server receives indications from the client above it and sends its
/// traffic back up as responses.
pub trait Server: Send + Sync {
    /// Deliver a PDU coming down from the layer above.
    fn indication(&self, pdu: Pdu) -> Result<()>;

    /// The slot holding the client above this server.
    fn upstream(&self) -> &Binding<dyn Client>;

    /// Send a PDU up to the bound client.
    fn response(&self, pdu: Pdu) -> Result<()> {
        self.upstream().get()?.confirmation(pdu)
    }
}

/// Connect a client/server pair by cross-assigning their peer slots.
///
/// Fails with [`CommError::AlreadyBound`] if either side already has a peer,
/// without modifying either slot.
pub fn bind<C, S>(client: &Arc<C>, server: &Arc<S>) -> Result<()>
where
    C: Client + 'static,
    S: Server + 'static,
{
    if client.downstream().is_bound() || server.upstream().is_bound() {
        return Err(CommError::AlreadyBound);
    }
    client.downstream().bind(server.clone() as Arc<dyn Server>)?;
    server.upstream().bind(client.clone() as Arc<dyn Client>)?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::{CapturingClient, CapturingServer};
    use super::*;

    #[test]
    fn test_bind_wires_both_directions() {
        let client = CapturingClient::new();
        let server = CapturingServer::new();
        bind(&client, &server).unwrap();

        client.request(Pdu::new(vec![1])).unwrap();
        assert_eq!(server.len(), 1);

        server.response(Pdu::new(vec![2])).unwrap();
        assert_eq!(client.len(), 1);
    }

    #[test]
    fn test_double_bind_rejected() {
        let client = CapturingClient::new();
        let server = CapturingServer::new();
        bind(&client, &server).unwrap();

        let other = CapturingServer::new();
        assert!(matches!(
            bind(&client, &other),
            Err(CommError::AlreadyBound)
        ));
        // the rejected bind left the new server untouched
        assert!(!other.upstream().is_bound());
    }

    #[test]
    fn test_unbound_request_fails() {
        let client = CapturingClient::new();
        assert!(matches!(
            client.request(Pdu::new(vec![])),
            Err(CommError::NotBound)
        ));
    }
}
