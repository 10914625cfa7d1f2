use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{HandleEvent, HandleEventListener};
use crate::core::{Address, Error, Result};

/// Cloneable write side of a physical connection
#[derive(Clone)]
pub struct HandleWriter {
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl HandleWriter {
    /// Queues one whole message for the wire.
    ///
    /// Returns `false` when the queue is full or the connection is closed;
    /// never blocks.
    pub fn write(&self, bytes: Bytes) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.outbound.try_send(bytes).is_ok()
    }
}

/// One physical connection as seen by the association layer
pub struct AssociationHandle {
    local_address: Address,
    remote_address: Address,
    writer: HandleWriter,
    listener: Option<oneshot::Sender<Arc<dyn HandleEventListener>>>,
}

/// Transport-side half of an [`AssociationHandle`].
///
/// The transport drains `outbound` onto the wire, waits on `listener` before
/// delivering any inbound bytes, and tears the connection down once `closed`
/// is cancelled.
pub struct HandleDriver {
    pub outbound: mpsc::Receiver<Bytes>,
    pub listener: oneshot::Receiver<Arc<dyn HandleEventListener>>,
    pub closed: CancellationToken,
}

impl AssociationHandle {
    /// Creates a handle with a write queue of `capacity` messages
    pub fn new(
        local_address: Address,
        remote_address: Address,
        capacity: usize,
    ) -> (AssociationHandle, HandleDriver) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        let (listener_tx, listener_rx) = oneshot::channel();
        let closed = CancellationToken::new();

        let handle = AssociationHandle {
            local_address,
            remote_address,
            writer: HandleWriter {
                outbound: outbound_tx,
                closed: closed.clone(),
            },
            listener: Some(listener_tx),
        };
        let driver = HandleDriver {
            outbound: outbound_rx,
            listener: listener_rx,
            closed,
        };
        (handle, driver)
    }

    pub fn local_address(&self) -> &Address {
        &self.local_address
    }

    pub fn remote_address(&self) -> &Address {
        &self.remote_address
    }

    /// See [`HandleWriter::write`]
    pub fn write(&self, bytes: Bytes) -> bool {
        self.writer.write(bytes)
    }

    pub fn writer(&self) -> HandleWriter {
        self.writer.clone()
    }

    /// Installs the consumer of inbound events; allowed exactly once
    pub fn register_listener(&mut self, listener: Arc<dyn HandleEventListener>) -> Result<()> {
        let slot = self.listener.take().ok_or_else(|| {
            Error::invalid_state(format!(
                "listener already registered on handle to {}",
                self.remote_address
            ))
        })?;
        if let Err(listener) = slot.send(listener) {
            // Transport side is already gone.
            listener.notify(HandleEvent::Disassociated(
                crate::core::DisassociateInfo::Unknown,
            ));
        }
        Ok(())
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_none()
    }

    /// Tears the physical connection down; repeated calls are harmless
    pub fn disassociate(&self) {
        self.writer.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.writer.closed.is_cancelled()
    }
}

impl Drop for AssociationHandle {
    // Whoever held the handle is gone; the connection must not outlive it.
    fn drop(&mut self) {
        self.writer.closed.cancel();
    }
}

impl fmt::Debug for AssociationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationHandle")
            .field("local_address", &self.local_address)
            .field("remote_address", &self.remote_address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (AssociationHandle, HandleDriver) {
        AssociationHandle::new(
            Address::local("loopback", "a"),
            Address::local("loopback", "b"),
            capacity,
        )
    }

    #[tokio::test]
    async fn test_write_reaches_driver() {
        let (handle, mut driver) = handle(4);
        assert!(handle.write(Bytes::from_static(b"one")));
        assert_eq!(driver.outbound.recv().await.unwrap(), Bytes::from_static(b"one"));
    }

    #[test]
    fn test_write_backpressure() {
        let (handle, _driver) = handle(1);
        assert!(handle.write(Bytes::from_static(b"one")));
        assert!(!handle.write(Bytes::from_static(b"two")));
    }

    #[test]
    fn test_write_after_disassociate_fails() {
        let (handle, driver) = handle(4);
        handle.disassociate();
        handle.disassociate();
        assert!(driver.closed.is_cancelled());
        assert!(!handle.write(Bytes::from_static(b"late")));
    }

    #[test]
    fn test_drop_closes_connection() {
        let (handle, driver) = handle(4);
        let writer = handle.writer();
        assert!(writer.write(Bytes::from_static(b"before")));

        drop(handle);
        assert!(driver.closed.is_cancelled());
        assert!(!writer.write(Bytes::from_static(b"after")));
    }

    #[tokio::test]
    async fn test_listener_registered_once() {
        let (mut handle, driver) = handle(4);
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle.register_listener(Arc::new(tx.clone())).unwrap();
        assert!(handle.has_listener());
        assert!(matches!(
            handle.register_listener(Arc::new(tx)),
            Err(Error::InvalidState(_))
        ));

        let listener = driver.listener.await.unwrap();
        listener.notify(HandleEvent::InboundPayload(Bytes::from_static(b"x")));
        assert_eq!(
            rx.recv().await.unwrap(),
            HandleEvent::InboundPayload(Bytes::from_static(b"x"))
        );
    }
}
