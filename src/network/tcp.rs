use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{AssociationHandle, FrameCodec, HandleDriver, HandleEvent, HandleEventListener, Transport};
use crate::core::{Address, DisassociateInfo, Error, Result, TransportConfig};

const SCHEME: &str = "tcp";
const LISTEN_BACKLOG: i32 = 1024;

/// TCP transport; one task per connection moves frames between the socket
/// and the handle
pub struct TcpTransport {
    system: String,
    bind_addr: SocketAddr,
    limits: Limits,
    shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    capacity: usize,
    max_frame_size: usize,
}

impl TcpTransport {
    /// Creates a transport for actor system `system`, listening on `bind_addr`
    /// once [`Transport::listen`] is called
    pub fn new(system: impl Into<String>, bind_addr: SocketAddr) -> Self {
        TcpTransport {
            system: system.into(),
            bind_addr,
            limits: Limits {
                capacity: crate::core::DEFAULT_OUTBOUND_BUFFER,
                max_frame_size: crate::core::DEFAULT_MAX_FRAME_SIZE,
            },
            shutdown: CancellationToken::new(),
        }
    }

    /// Overrides handle queue capacity and frame limit
    pub fn with_limits(mut self, capacity: usize, max_frame_size: usize) -> Self {
        self.limits = Limits {
            capacity,
            max_frame_size: max_frame_size.min(crate::core::MAX_FRAME_SIZE),
        };
        self
    }

    fn bind(&self) -> Result<TcpListener> {
        let socket = Socket::new(
            Domain::for_address(self.bind_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&self.bind_addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        Ok(TcpListener::from_std(socket.into())?)
    }
}

fn tcp_address(system: &str, addr: SocketAddr) -> Address {
    Address::remote(SCHEME, system, addr.ip().to_string(), addr.port())
}

fn spawn_connection(
    stream: TcpStream,
    local: Address,
    remote: Address,
    limits: Limits,
    shutdown: CancellationToken,
) -> AssociationHandle {
    let (handle, driver) = AssociationHandle::new(local, remote.clone(), limits.capacity);
    let codec = FrameCodec::new(limits.max_frame_size);
    tokio::spawn(async move {
        if let Err(e) = run_connection(stream, codec, driver, shutdown).await {
            debug!(remote = %remote, error = %e, "tcp connection closed with error");
        }
    });
    handle
}

impl Transport for TcpTransport {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn listen(&self) -> BoxFuture<'_, Result<(Address, mpsc::Receiver<AssociationHandle>)>> {
        Box::pin(async move {
            let listener = self.bind()?;
            let local = tcp_address(&self.system, listener.local_addr()?);
            let (tx, rx) = mpsc::channel(64);
            debug!(address = %local, "tcp transport listening");

            let accept_local = local.clone();
            let system = self.system.clone();
            let limits = self.limits;
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let accepted = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                trace!(error = %e, "failed to set TCP_NODELAY");
                            }
                            let handle = spawn_connection(
                                stream,
                                accept_local.clone(),
                                tcp_address(&system, peer),
                                limits,
                                shutdown.clone(),
                            );
                            if tx.send(handle).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to accept tcp connection"),
                    }
                }
                debug!(address = %accept_local, "tcp acceptor stopped");
            });

            Ok((local, rx))
        })
    }

    fn associate(&self, remote: Address) -> BoxFuture<'_, Result<AssociationHandle>> {
        Box::pin(async move {
            let (Some(host), Some(port)) = (remote.host(), remote.port()) else {
                return Err(Error::transport(format!("{} has no host and port", remote)));
            };
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::transport(format!("connect to {} failed: {}", remote, e)))?;
            stream.set_nodelay(true)?;
            let local = tcp_address(&self.system, stream.local_addr()?);
            Ok(spawn_connection(
                stream,
                local,
                remote,
                self.limits,
                self.shutdown.clone(),
            ))
        })
    }

    fn configure(&mut self, config: &TransportConfig) {
        self.limits = Limits {
            capacity: config.outbound_buffer,
            max_frame_size: config.max_frame_size.min(crate::core::MAX_FRAME_SIZE),
        };
    }

    fn max_message_size(&self) -> Option<usize> {
        Some(self.limits.max_frame_size)
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.shutdown.cancel();
            Ok(())
        })
    }
}

/// Moves frames between one socket and its handle until either side closes
async fn run_connection(
    stream: TcpStream,
    codec: FrameCodec,
    driver: HandleDriver,
    shutdown: CancellationToken,
) -> Result<()> {
    let HandleDriver {
        mut outbound,
        listener: mut registration,
        closed,
    } = driver;
    let (mut sink, mut frames) = Framed::new(stream, codec).split();

    let mut open = true;
    let mut listener: Option<Arc<dyn HandleEventListener>> = None;

    // Writes flow before a listener exists; reads wait for it.
    while open && listener.is_none() {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(bytes) => {
                    if let Err(e) = sink.send(bytes).await {
                        debug!(error = %e, "tcp write failed");
                        open = false;
                    }
                }
                None => open = false,
            },
            _ = closed.cancelled() => open = false,
            _ = shutdown.cancelled() => open = false,
            registered = &mut registration => match registered {
                Ok(registered) => listener = Some(registered),
                Err(_) => open = false,
            },
        }
    }

    if let Some(listener) = &listener {
        while open {
            tokio::select! {
                biased;
                frame = outbound.recv() => match frame {
                    Some(bytes) => {
                        if let Err(e) = sink.send(bytes).await {
                            debug!(error = %e, "tcp write failed");
                            open = false;
                        }
                    }
                    None => open = false,
                },
                _ = closed.cancelled() => open = false,
                _ = shutdown.cancelled() => open = false,
                frame = frames.next() => match frame {
                    Some(Ok(bytes)) => listener.notify(HandleEvent::InboundPayload(bytes)),
                    Some(Err(e)) => {
                        debug!(error = %e, "tcp read failed");
                        open = false;
                    }
                    None => open = false,
                },
            }
        }
    }

    // Flush what was queued before the close request, e.g. a Disassociate PDU.
    closed.cancel();
    let mut flushed = Ok(());
    while let Ok(bytes) = outbound.try_recv() {
        if let Err(e) = sink.feed(bytes).await {
            flushed = Err(e);
            break;
        }
    }
    if flushed.is_ok() {
        flushed = sink.close().await;
    }
    if let Some(listener) = &listener {
        listener.notify(HandleEvent::Disassociated(DisassociateInfo::Unknown));
    }
    flushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let server = TcpTransport::new("server", loopback());
        let client = TcpTransport::new("client", loopback());
        let (server_addr, mut inbound) = server.listen().await.unwrap();
        assert_eq!(server_addr.protocol(), "tcp");

        let mut outbound = client.associate(server_addr.clone()).await.unwrap();
        let mut accepted = inbound.recv().await.unwrap();

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        accepted.register_listener(Arc::new(server_tx)).unwrap();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        outbound.register_listener(Arc::new(client_tx)).unwrap();

        assert!(outbound.write(Bytes::from_static(b"ping")));
        assert_eq!(
            server_rx.recv().await.unwrap(),
            HandleEvent::InboundPayload(Bytes::from_static(b"ping"))
        );
        assert!(accepted.write(Bytes::from_static(b"pong")));
        assert_eq!(
            client_rx.recv().await.unwrap(),
            HandleEvent::InboundPayload(Bytes::from_static(b"pong"))
        );

        outbound.disassociate();
        assert_eq!(
            server_rx.recv().await.unwrap(),
            HandleEvent::Disassociated(DisassociateInfo::Unknown)
        );

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_associate_without_location_fails() {
        let client = TcpTransport::new("client", loopback());
        let result = client.associate(Address::local("tcp", "nowhere")).await;
        assert!(matches!(result, Err(Error::TransportFailure(_))));
    }

    #[test]
    fn test_configure_adopts_limits() {
        let mut transport = TcpTransport::new("node", loopback());
        assert_eq!(
            transport.max_message_size(),
            Some(crate::core::DEFAULT_MAX_FRAME_SIZE)
        );
        transport.configure(&TransportConfig {
            outbound_buffer: 8,
            max_frame_size: 1024 * 1024,
            ..TransportConfig::default()
        });
        assert_eq!(transport.limits.capacity, 8);
        assert_eq!(transport.max_message_size(), Some(1024 * 1024));
    }
}
