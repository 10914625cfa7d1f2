use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, trace, warn};

use super::codec::PduCodec;
use super::handle::{AssociationEventListener, ProtocolHandle};
use super::state::{Association, AssociationSettings, FsmEvent, PendingResult};
use crate::core::{Address, DisassociateInfo, Error, HandshakeInfo, Result, TransportConfig};
use crate::network::{AssociationHandle, ManagementCommand, Transport};
use crate::util::encode_name;

/// Snapshot of one live association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationInfo {
    /// Unique diagnostic name
    pub name: String,
    pub remote_address: Address,
    /// `true` when the peer initiated the association
    pub inbound: bool,
}

enum Command {
    Listening {
        local: Address,
        inbound: mpsc::Receiver<AssociationHandle>,
        listener: Arc<dyn AssociationEventListener>,
        reply: oneshot::Sender<Result<()>>,
    },
    Associate {
        remote: Address,
        refuse_uid: Option<u64>,
        reply: PendingResult,
    },
    Quarantine(u64),
    Associations(oneshot::Sender<Vec<AssociationInfo>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

/// Association layer on top of a physical transport.
///
/// Every outbound request and every accepted connection gets its own
/// association task. A failing or panicking association stops alone; the
/// manager and its siblings keep running.
pub struct ProtocolTransport {
    wrapped: Arc<dyn Transport>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ProtocolTransport {
    /// Wraps `transport` after handing it the limits of `config`; must be
    /// called inside a tokio runtime
    pub fn new(mut transport: impl Transport, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        transport.configure(&config);
        Self::from_shared(Arc::new(transport), config)
    }

    /// Wraps a transport that is also used elsewhere.
    ///
    /// The transport keeps its own limits. Payload that would exceed its
    /// largest message is refused by [`ProtocolHandle::write`].
    pub fn from_shared(wrapped: Arc<dyn Transport>, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let (commands, receiver) = mpsc::unbounded_channel();
        let manager = Manager::new(wrapped.clone(), config);
        tokio::spawn(manager.run(receiver));
        Ok(ProtocolTransport { wrapped, commands })
    }

    /// Binds the physical transport and starts accepting inbound associations.
    ///
    /// Each inbound association that completes its handshake is announced to
    /// `listener`. Returns the address announced to peers.
    pub async fn listen(&self, listener: Arc<dyn AssociationEventListener>) -> Result<Address> {
        let (local, inbound) = self.wrapped.listen().await?;
        let (reply, done) = oneshot::channel();
        self.send(Command::Listening {
            local: local.clone(),
            inbound,
            listener,
            reply,
        })?;
        done.await.map_err(|_| manager_gone())??;
        info!(address = %local, "association layer listening");
        Ok(local)
    }

    /// Opens an association to `remote`, refusing a peer presenting `refuse_uid`
    pub async fn associate(&self, remote: Address, refuse_uid: Option<u64>) -> Result<ProtocolHandle> {
        let (reply, result) = oneshot::channel();
        self.send(Command::Associate {
            remote,
            refuse_uid,
            reply,
        })?;
        result.await.map_err(|_| manager_gone())?
    }

    /// Refuses `uid` in every association started from now on
    pub fn quarantine(&self, uid: u64) -> Result<()> {
        self.send(Command::Quarantine(uid))
    }

    /// Lists the associations that are currently alive
    pub async fn associations(&self) -> Result<Vec<AssociationInfo>> {
        let (reply, snapshot) = oneshot::channel();
        self.send(Command::Associations(reply))?;
        snapshot.await.map_err(|_| manager_gone())
    }

    /// Forwards a command to the physical transport
    pub async fn management_command(&self, command: ManagementCommand) -> Result<bool> {
        self.wrapped.management_command(command).await
    }

    /// Disassociates everything with reason `Shutdown` and stops the physical transport
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Shutdown(reply))?;
        done.await.map_err(|_| manager_gone())?
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| manager_gone())
    }
}

fn manager_gone() -> Error {
    Error::invalid_state("association manager has shut down")
}

struct Entry {
    remote_address: Address,
    inbound: bool,
    control: mpsc::UnboundedSender<FsmEvent>,
}

/// Sequential owner of the association registry
struct Manager {
    wrapped: Arc<dyn Transport>,
    config: TransportConfig,
    codec: PduCodec,
    local: Option<HandshakeInfo>,
    listener: Option<Arc<dyn AssociationEventListener>>,
    quarantined: HashSet<u64>,
    associations: HashMap<String, Entry>,
    tasks: JoinSet<(String, bool)>,
    counter: u64,
}

impl Manager {
    fn new(wrapped: Arc<dyn Transport>, config: TransportConfig) -> Self {
        let limit = wrapped
            .max_message_size()
            .map_or(config.max_frame_size, |max| max.min(config.max_frame_size));
        let codec = PduCodec::new(limit);
        Manager {
            wrapped,
            config,
            codec,
            local: None,
            listener: None,
            quarantined: HashSet::new(),
            associations: HashMap::new(),
            tasks: JoinSet::new(),
            counter: 0,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut inbound: Option<mpsc::Receiver<AssociationHandle>> = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        let result = self.shutdown().await;
                        let _ = reply.send(result);
                        break;
                    }
                    Some(command) => self.handle(command, &mut inbound),
                    None => {
                        if let Err(e) = self.shutdown().await {
                            debug!(error = %e, "transport shutdown failed");
                        }
                        break;
                    }
                },
                accepted = accept(&mut inbound) => match accepted {
                    Some(handle) => self.spawn_inbound(handle),
                    None => {
                        debug!("physical transport stopped accepting");
                        inbound = None;
                    }
                },
                Some(joined) = self.tasks.join_next() => self.reap(joined),
            }
        }
        debug!("association manager stopped");
    }

    fn handle(&mut self, command: Command, inbound: &mut Option<mpsc::Receiver<AssociationHandle>>) {
        match command {
            Command::Listening {
                local,
                inbound: accepted,
                listener,
                reply,
            } => {
                if self.local.is_some() {
                    let _ = reply.send(Err(Error::invalid_state("already listening")));
                    return;
                }
                self.local = Some(HandshakeInfo::new(local, self.config.system_uid));
                self.listener = Some(listener);
                *inbound = Some(accepted);
                let _ = reply.send(Ok(()));
            }
            Command::Associate {
                remote,
                refuse_uid,
                reply,
            } => self.spawn_outbound(remote, refuse_uid, reply),
            Command::Quarantine(uid) => {
                debug!(uid, "quarantined");
                self.quarantined.insert(uid);
            }
            Command::Associations(reply) => {
                let snapshot = self
                    .associations
                    .iter()
                    .map(|(name, entry)| AssociationInfo {
                        name: name.clone(),
                        remote_address: entry.remote_address.clone(),
                        inbound: entry.inbound,
                    })
                    .collect();
                let _ = reply.send(snapshot);
            }
            // Intercepted by the run loop.
            Command::Shutdown(reply) => {
                let _ = reply.send(Err(Error::invalid_state("shutdown already in progress")));
            }
        }
    }

    fn spawn_outbound(&mut self, remote: Address, refuse_uid: Option<u64>, reply: PendingResult) {
        let Some(local) = self.local.clone() else {
            let _ = reply.send(Err(Error::invalid_state(
                "listen must complete before associating",
            )));
            return;
        };
        let mut refused = self.refused_uids();
        refused.extend(refuse_uid);

        let name = self.next_name(&remote);
        let settings = self.settings(local, refused);
        let (control, run) = Association::outbound(
            name.clone(),
            settings,
            self.wrapped.clone(),
            remote.clone(),
            reply,
        );
        self.supervise(name, remote, false, control, run);
    }

    fn spawn_inbound(&mut self, handle: AssociationHandle) {
        let (Some(local), Some(listener)) = (self.local.clone(), self.listener.clone()) else {
            handle.disassociate();
            return;
        };
        let remote = handle.remote_address().clone();
        let name = self.next_name(&remote);
        let settings = self.settings(local, self.refused_uids());
        let (control, run) = Association::inbound(name.clone(), settings, handle, listener);
        self.supervise(name, remote, true, control, run);
    }

    fn supervise<F>(
        &mut self,
        name: String,
        remote_address: Address,
        inbound: bool,
        control: mpsc::UnboundedSender<FsmEvent>,
        run: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(association = %name, remote = %remote_address, inbound, "spawning association");
        self.associations.insert(
            name.clone(),
            Entry {
                remote_address,
                inbound,
                control,
            },
        );
        // Stop, never restart: a panic ends this association only.
        self.tasks.spawn(async move {
            let panicked = AssertUnwindSafe(run).catch_unwind().await.is_err();
            (name, panicked)
        });
    }

    fn reap(&mut self, joined: std::result::Result<(String, bool), JoinError>) {
        match joined {
            Ok((name, panicked)) => {
                self.associations.remove(&name);
                if panicked {
                    warn!(association = %name, "association task panicked and was stopped");
                } else {
                    trace!(association = %name, "association task finished");
                }
            }
            Err(e) => warn!(error = %e, "association task did not complete"),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        info!(associations = self.associations.len(), "shutting down association layer");
        for entry in self.associations.values() {
            let _ = entry
                .control
                .send(FsmEvent::Disassociate(DisassociateInfo::Shutdown));
        }
        while let Some(joined) = self.tasks.join_next().await {
            self.reap(joined);
        }
        self.wrapped.shutdown().await
    }

    fn refused_uids(&self) -> HashSet<u64> {
        self.config
            .refused_uids
            .iter()
            .copied()
            .chain(self.quarantined.iter().copied())
            .collect()
    }

    fn settings(&self, local: HandshakeInfo, refused_uids: HashSet<u64>) -> AssociationSettings {
        AssociationSettings {
            local,
            refused_uids,
            codec: self.codec,
            heartbeat_interval: self.config.heartbeat_interval,
            backoff_interval: self.config.backoff_interval,
            detector: self
                .config
                .failure_detector
                .build(self.config.heartbeat_interval),
        }
    }

    fn next_name(&mut self, remote: &Address) -> String {
        self.counter += 1;
        format!(
            "association-{}-{}",
            encode_name(&remote.to_string()),
            self.counter
        )
    }
}

async fn accept(inbound: &mut Option<mpsc::Receiver<AssociationHandle>>) -> Option<AssociationHandle> {
    match inbound {
        Some(inbound) => inbound.recv().await,
        None => std::future::pending().await,
    }
}
