use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::codec::PduCodec;
use super::state::FsmEvent;
use crate::core::{Address, DisassociateInfo, Error, HandshakeInfo, Result};
use crate::network::{HandleEvent, HandleEventListener, HandleWriter};

/// A handshake-negotiated, heartbeat-monitored association.
///
/// Payload written here travels as Payload PDUs. Inbound payload is held by
/// the association until a listener is registered, then replayed in order.
pub struct ProtocolHandle {
    local_address: Address,
    remote_address: Address,
    handshake_info: HandshakeInfo,
    writer: HandleWriter,
    codec: PduCodec,
    listener: Option<oneshot::Sender<Arc<dyn HandleEventListener>>>,
    association: mpsc::UnboundedSender<FsmEvent>,
}

impl ProtocolHandle {
    pub(crate) fn new(
        local_address: Address,
        remote_address: Address,
        handshake_info: HandshakeInfo,
        writer: HandleWriter,
        codec: PduCodec,
        listener: oneshot::Sender<Arc<dyn HandleEventListener>>,
        association: mpsc::UnboundedSender<FsmEvent>,
    ) -> Self {
        ProtocolHandle {
            local_address,
            remote_address,
            handshake_info,
            writer,
            codec,
            listener: Some(listener),
            association,
        }
    }

    pub fn local_address(&self) -> &Address {
        &self.local_address
    }

    pub fn remote_address(&self) -> &Address {
        &self.remote_address
    }

    /// Identity the peer presented during the handshake
    pub fn handshake_info(&self) -> &HandshakeInfo {
        &self.handshake_info
    }

    /// Sends application bytes; `false` signals backpressure or a closed association
    pub fn write(&self, payload: Bytes) -> bool {
        match self.codec.encode_payload(payload) {
            Ok(pdu) => self.writer.write(pdu),
            Err(e) => {
                trace!(remote = %self.remote_address, error = %e, "payload not written");
                false
            }
        }
    }

    /// Installs the consumer of inbound events; allowed exactly once
    pub fn register_listener(&mut self, listener: Arc<dyn HandleEventListener>) -> Result<()> {
        let slot = self.listener.take().ok_or_else(|| {
            Error::invalid_state(format!(
                "listener already registered on association with {}",
                self.remote_address
            ))
        })?;
        if let Err(listener) = slot.send(listener) {
            // Association ended and stopped waiting; tell the listener right away.
            listener.notify(HandleEvent::Disassociated(DisassociateInfo::Unknown));
        }
        Ok(())
    }

    /// Registers a channel as listener and returns its receiving end
    pub fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<HandleEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register_listener(Arc::new(tx))?;
        Ok(rx)
    }

    /// Closes the association with reason `Unknown`
    pub fn disassociate(&self) {
        self.disassociate_with(DisassociateInfo::Unknown);
    }

    /// Closes the association, telling the peer `reason`; no-op once terminated
    pub fn disassociate_with(&self, reason: DisassociateInfo) {
        let _ = self.association.send(FsmEvent::Disassociate(reason));
    }
}

impl fmt::Debug for ProtocolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolHandle")
            .field("local_address", &self.local_address)
            .field("remote_address", &self.remote_address)
            .field("peer_uid", &self.handshake_info.uid)
            .finish()
    }
}

/// A new inbound association, ready for a listener
#[derive(Debug)]
pub struct InboundAssociation {
    pub handle: ProtocolHandle,
}

/// Consumer of inbound-association notifications
pub trait AssociationEventListener: Send + Sync + 'static {
    fn notify(&self, event: InboundAssociation);
}

impl AssociationEventListener for mpsc::UnboundedSender<InboundAssociation> {
    fn notify(&self, event: InboundAssociation) {
        let _ = self.send(event);
    }
}
