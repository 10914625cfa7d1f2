//! Physical transport contract and implementations
//!
//! This module defines what the association layer needs from the wire: open a
//! connection, accept connections, write whole messages, tear down. It also
//! ships a TCP transport and an in-memory loopback transport.

mod frame;
mod handle;
mod loopback;
mod tcp;

pub use self::frame::FrameCodec;
pub use self::handle::{AssociationHandle, HandleDriver, HandleWriter};
pub use self::loopback::{LoopbackRegistry, LoopbackTransport};
pub use self::tcp::TcpTransport;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::core::{Address, DisassociateInfo, Result, TransportConfig};

/// Event delivered to the consumer registered on a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleEvent {
    /// One whole inbound message
    InboundPayload(Bytes),
    /// The connection is gone
    Disassociated(DisassociateInfo),
}

/// Consumer of inbound events for one handle
pub trait HandleEventListener: Send + Sync + 'static {
    fn notify(&self, event: HandleEvent);
}

impl HandleEventListener for mpsc::UnboundedSender<HandleEvent> {
    fn notify(&self, event: HandleEvent) {
        // A consumer that went away has nothing left to learn.
        let _ = self.send(event);
    }
}

/// Out-of-band commands understood by some transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementCommand {
    /// Drops every connection to the given remote address
    ForceDisassociate(Address),
}

/// A physical transport
pub trait Transport: Send + Sync + 'static {
    /// Scheme of the addresses this transport serves
    fn scheme(&self) -> &str;

    /// Starts accepting connections; returns the bound address and the stream
    /// of accepted connections
    fn listen(&self) -> BoxFuture<'_, Result<(Address, mpsc::Receiver<AssociationHandle>)>>;

    /// Opens a connection to `remote`
    fn associate(&self, remote: Address) -> BoxFuture<'_, Result<AssociationHandle>>;

    /// Adopts the write queue capacity and frame limit of `config`; called
    /// before the transport is shared
    fn configure(&mut self, _config: &TransportConfig) {}

    /// Largest message one connection can carry, if the transport bounds it
    fn max_message_size(&self) -> Option<usize> {
        None
    }

    /// Returns `Ok(true)` when the command was understood and applied
    fn management_command(&self, _command: ManagementCommand) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async { Ok(false) })
    }

    /// Stops listening and drops every connection
    fn shutdown(&self) -> BoxFuture<'_, Result<()>>;
}
