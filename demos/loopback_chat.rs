use std::sync::Arc;
use std::time::Duration;

use assoc_transport::network::{LoopbackRegistry, LoopbackTransport};
use assoc_transport::{
    Address, DisassociateInfo, HandleEvent, InboundAssociation, ProtocolTransport, TransportConfig,
};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> assoc_transport::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    // Short heartbeats so the exchange is visible in the log
    let mut config = TransportConfig::default();
    config.heartbeat_interval = Duration::from_millis(250);

    let registry = LoopbackRegistry::new();
    let alice = ProtocolTransport::new(
        LoopbackTransport::new(registry.clone(), Address::local("loopback", "alice")),
        config.clone(),
    )?;
    let bob = ProtocolTransport::new(
        LoopbackTransport::new(registry, Address::local("loopback", "bob")),
        config,
    )?;

    let (alice_tx, _alice_inbound) = mpsc::unbounded_channel::<InboundAssociation>();
    alice.listen(Arc::new(alice_tx)).await?;
    let (bob_tx, mut bob_inbound) = mpsc::unbounded_channel();
    let bob_address = bob.listen(Arc::new(bob_tx)).await?;

    // Bob answers every line with an uppercase echo
    tokio::spawn(async move {
        while let Some(InboundAssociation { mut handle }) = bob_inbound.recv().await {
            info!(peer = %handle.remote_address(), "bob accepted an association");
            let Ok(mut events) = handle.subscribe() else {
                continue;
            };
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        HandleEvent::InboundPayload(line) => {
                            let reply = String::from_utf8_lossy(&line).to_uppercase();
                            handle.write(Bytes::from(reply));
                        }
                        HandleEvent::Disassociated(reason) => {
                            info!(%reason, "bob lost alice");
                            break;
                        }
                    }
                }
            });
        }
    });

    let mut handle = alice.associate(bob_address, None).await?;
    info!(peer_uid = handle.handshake_info().uid, "alice associated with bob");
    let mut events = handle.subscribe()?;

    for line in ["hello bob", "how are the heartbeats", "goodbye"] {
        handle.write(Bytes::from_static(line.as_bytes()));
        if let Some(HandleEvent::InboundPayload(reply)) = events.recv().await {
            println!("alice> {}\nbob>   {}", line, String::from_utf8_lossy(&reply));
        }
    }

    // Let a few heartbeats go by
    tokio::time::sleep(Duration::from_secs(1)).await;

    handle.disassociate_with(DisassociateInfo::Shutdown);
    alice.shutdown().await?;
    bob.shutdown().await?;
    Ok(())
}
