use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AssociationHandle, HandleDriver, HandleEvent, HandleEventListener, ManagementCommand, Transport};
use crate::core::{Address, DisassociateInfo, Error, Result, TransportConfig, DEFAULT_OUTBOUND_BUFFER};

const LISTEN_BACKLOG: usize = 64;

/// Shared in-memory "network" connecting loopback transports
#[derive(Clone, Default)]
pub struct LoopbackRegistry {
    listeners: Arc<Mutex<HashMap<Address, mpsc::Sender<AssociationHandle>>>>,
}

impl LoopbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bind(&self, address: Address) -> Result<mpsc::Receiver<AssociationHandle>> {
        let mut listeners = self
            .listeners
            .lock()
            .map_err(|_| Error::invalid_state("loopback registry poisoned"))?;
        if listeners.get(&address).is_some_and(|tx| !tx.is_closed()) {
            return Err(Error::transport(format!("{} is already bound", address)));
        }
        let (tx, rx) = mpsc::channel(LISTEN_BACKLOG);
        listeners.insert(address, tx);
        Ok(rx)
    }

    fn lookup(&self, address: &Address) -> Option<mpsc::Sender<AssociationHandle>> {
        self.listeners.lock().ok()?.get(address).cloned()
    }

    fn unbind(&self, address: &Address) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(address);
        }
    }
}

/// In-memory transport; every transport sharing a registry can reach the others
pub struct LoopbackTransport {
    local: Address,
    registry: LoopbackRegistry,
    capacity: usize,
    links: Mutex<Vec<(Address, CancellationToken)>>,
}

impl LoopbackTransport {
    pub fn new(registry: LoopbackRegistry, local: Address) -> Self {
        LoopbackTransport {
            local,
            registry,
            capacity: DEFAULT_OUTBOUND_BUFFER,
            links: Mutex::new(Vec::new()),
        }
    }

    /// Overrides the write queue capacity of created handles
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn local_address(&self) -> &Address {
        &self.local
    }

    fn track(&self, remote: Address, link: CancellationToken) {
        if let Ok(mut links) = self.links.lock() {
            links.retain(|(_, token)| !token.is_cancelled());
            links.push((remote, link));
        }
    }

    fn drop_links(&self, remote: Option<&Address>) -> bool {
        let Ok(mut links) = self.links.lock() else {
            return false;
        };
        let mut dropped = false;
        links.retain(|(address, token)| {
            let matches = remote.map_or(true, |remote| remote == address);
            if matches {
                token.cancel();
                dropped = true;
            }
            !matches
        });
        dropped
    }
}

impl Transport for LoopbackTransport {
    fn scheme(&self) -> &str {
        self.local.protocol()
    }

    fn listen(&self) -> BoxFuture<'_, Result<(Address, mpsc::Receiver<AssociationHandle>)>> {
        Box::pin(async move {
            let inbound = self.registry.bind(self.local.clone())?;
            debug!(address = %self.local, "loopback transport listening");
            Ok((self.local.clone(), inbound))
        })
    }

    fn associate(&self, remote: Address) -> BoxFuture<'_, Result<AssociationHandle>> {
        Box::pin(async move {
            let acceptor = self
                .registry
                .lookup(&remote)
                .ok_or_else(|| Error::transport(format!("no loopback listener at {}", remote)))?;

            let (ours, our_driver) =
                AssociationHandle::new(self.local.clone(), remote.clone(), self.capacity);
            let (theirs, their_driver) =
                AssociationHandle::new(remote.clone(), self.local.clone(), self.capacity);

            let link = spawn_link(our_driver, their_driver);
            acceptor.send(theirs).await.map_err(|_| {
                link.cancel();
                Error::transport(format!("loopback listener at {} is gone", remote))
            })?;
            self.track(remote, link);
            Ok(ours)
        })
    }

    fn configure(&mut self, config: &TransportConfig) {
        self.capacity = config.outbound_buffer;
    }

    fn management_command(&self, command: ManagementCommand) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            match command {
                ManagementCommand::ForceDisassociate(remote) => {
                    Ok(self.drop_links(Some(&remote)))
                }
            }
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.registry.unbind(&self.local);
            self.drop_links(None);
            Ok(())
        })
    }
}

/// Cross-wires two drivers; returns the token that tears the pair down
fn spawn_link(a: HandleDriver, b: HandleDriver) -> CancellationToken {
    let link = CancellationToken::new();

    let HandleDriver {
        outbound: a_out,
        listener: a_listener,
        closed: a_closed,
    } = a;
    let HandleDriver {
        outbound: b_out,
        listener: b_listener,
        closed: b_closed,
    } = b;

    let watcher = link.clone();
    let (a_watch, b_watch) = (a_closed.clone(), b_closed.clone());
    tokio::spawn(async move {
        tokio::select! {
            _ = a_watch.cancelled() => {}
            _ = b_watch.cancelled() => {}
            _ = watcher.cancelled() => {}
        }
        watcher.cancel();
        a_watch.cancel();
        b_watch.cancel();
    });

    let sides = [a_closed.clone(), b_closed.clone()];
    tokio::spawn(pump(a_out, b_listener, link.clone(), sides.clone()));
    tokio::spawn(pump(b_out, a_listener, link.clone(), sides));
    link
}

/// Moves one direction of traffic, then reports the teardown to the receiver
async fn pump(
    mut source: mpsc::Receiver<Bytes>,
    destination: oneshot::Receiver<Arc<dyn HandleEventListener>>,
    link: CancellationToken,
    sides: [CancellationToken; 2],
) {
    let listener = tokio::select! {
        _ = link.cancelled() => return,
        registered = destination => match registered {
            Ok(listener) => listener,
            Err(_) => {
                link.cancel();
                return;
            }
        },
    };

    loop {
        tokio::select! {
            biased;
            frame = source.recv() => match frame {
                Some(bytes) => listener.notify(HandleEvent::InboundPayload(bytes)),
                None => break,
            },
            _ = link.cancelled() => break,
        }
    }

    link.cancel();
    for side in &sides {
        side.cancel();
    }
    listener.notify(HandleEvent::Disassociated(DisassociateInfo::Unknown));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(system: &str) -> Address {
        Address::local("loopback", system)
    }

    #[tokio::test]
    async fn test_associate_unknown_address_fails() {
        let transport = LoopbackTransport::new(LoopbackRegistry::new(), address("a"));
        let result = transport.associate(address("nobody")).await;
        assert!(matches!(result, Err(Error::TransportFailure(_))));
    }

    #[tokio::test]
    async fn test_double_bind_fails() {
        let registry = LoopbackRegistry::new();
        let first = LoopbackTransport::new(registry.clone(), address("a"));
        let second = LoopbackTransport::new(registry, address("a"));
        let _inbound = first.listen().await.unwrap();
        assert!(second.listen().await.is_err());
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let registry = LoopbackRegistry::new();
        let client = LoopbackTransport::new(registry.clone(), address("client"));
        let server = LoopbackTransport::new(registry, address("server"));
        let (_, mut inbound) = server.listen().await.unwrap();

        let mut outbound = client.associate(address("server")).await.unwrap();
        let mut accepted = inbound.recv().await.unwrap();
        assert_eq!(accepted.remote_address(), &address("client"));

        // Written before the receiver registered; must be held back, not lost.
        assert!(outbound.write(Bytes::from_static(b"early")));

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        accepted.register_listener(Arc::new(server_tx)).unwrap();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        outbound.register_listener(Arc::new(client_tx)).unwrap();

        assert_eq!(
            server_rx.recv().await.unwrap(),
            HandleEvent::InboundPayload(Bytes::from_static(b"early"))
        );
        assert!(accepted.write(Bytes::from_static(b"reply")));
        assert_eq!(
            client_rx.recv().await.unwrap(),
            HandleEvent::InboundPayload(Bytes::from_static(b"reply"))
        );

        outbound.disassociate();
        assert_eq!(
            server_rx.recv().await.unwrap(),
            HandleEvent::Disassociated(DisassociateInfo::Unknown)
        );
    }

    #[tokio::test]
    async fn test_configure_sets_queue_capacity() {
        let registry = LoopbackRegistry::new();
        let mut client = LoopbackTransport::new(registry.clone(), address("client"));
        client.configure(&TransportConfig {
            outbound_buffer: 1,
            ..TransportConfig::default()
        });
        let server = LoopbackTransport::new(registry, address("server"));
        let (_, mut inbound) = server.listen().await.unwrap();

        let outbound = client.associate(address("server")).await.unwrap();
        let _accepted = inbound.recv().await.unwrap();
        // Nothing drains until the receiver registers a listener.
        assert!(outbound.write(Bytes::from_static(b"one")));
        assert!(!outbound.write(Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn test_force_disassociate() {
        let registry = LoopbackRegistry::new();
        let client = LoopbackTransport::new(registry.clone(), address("client"));
        let server = LoopbackTransport::new(registry, address("server"));
        let (_, mut inbound) = server.listen().await.unwrap();

        let mut outbound = client.associate(address("server")).await.unwrap();
        let _accepted = inbound.recv().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        outbound.register_listener(Arc::new(tx)).unwrap();

        let applied = client
            .management_command(ManagementCommand::ForceDisassociate(address("server")))
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(
            rx.recv().await.unwrap(),
            HandleEvent::Disassociated(DisassociateInfo::Unknown)
        );
        assert!(!outbound.write(Bytes::from_static(b"late")));
    }
}
