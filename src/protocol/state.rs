use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::codec::PduCodec;
use super::handle::{AssociationEventListener, InboundAssociation, ProtocolHandle};
use super::message::Pdu;
use crate::core::{Address, DisassociateInfo, Error, HandshakeInfo, Result};
use crate::detector::BoxedFailureDetector;
use crate::network::{AssociationHandle, HandleEvent, HandleEventListener, Transport};

/// Control state of one association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    /// Outbound only: waiting for the physical connection or for room to send Associate
    Closed,
    /// Associate exchanged in at most one direction
    WaitHandshake,
    /// Handshake complete
    Open,
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssociationState::Closed => "Closed",
            AssociationState::WaitHandshake => "WaitHandshake",
            AssociationState::Open => "Open",
        };
        f.write_str(name)
    }
}

/// Receives the outcome of an outbound association attempt
pub(crate) type PendingResult = oneshot::Sender<Result<ProtocolHandle>>;

/// Everything an association reacts to, fed through one queue
pub(crate) enum FsmEvent {
    /// The physical connect attempt finished
    Connected(Result<AssociationHandle>),
    /// Backoff elapsed after a refused Associate write
    RetryAssociate,
    /// Raw event from the physical handle
    Inbound(HandleEvent),
    HeartbeatTimer,
    /// The application registered its listener
    ListenerRegistered(Arc<dyn HandleEventListener>),
    /// The application dropped its handle without registering
    ListenerAbandoned,
    /// Local request to close
    Disassociate(DisassociateInfo),
}

impl FsmEvent {
    fn kind(&self) -> &'static str {
        match self {
            FsmEvent::Connected(_) => "Connected",
            FsmEvent::RetryAssociate => "RetryAssociate",
            FsmEvent::Inbound(HandleEvent::InboundPayload(_)) => "InboundPayload",
            FsmEvent::Inbound(HandleEvent::Disassociated(_)) => "Disassociated",
            FsmEvent::HeartbeatTimer => "HeartbeatTimer",
            FsmEvent::ListenerRegistered(_) => "ListenerRegistered",
            FsmEvent::ListenerAbandoned => "ListenerAbandoned",
            FsmEvent::Disassociate(_) => "Disassociate",
        }
    }
}

/// Data carried alongside the control state.
///
/// While a backpressured Associate waits for its retry the state is still
/// `Closed` but the data is already `OutboundUnderlyingAssociated`, so the
/// physical handle stays owned by this association.
pub(crate) enum ProtocolStateData {
    OutboundUnassociated {
        remote_address: Address,
        pending: PendingResult,
        transport: Arc<dyn Transport>,
    },
    OutboundUnderlyingAssociated {
        pending: PendingResult,
        handle: AssociationHandle,
    },
    InboundUnassociated {
        listener: Arc<dyn AssociationEventListener>,
        handle: AssociationHandle,
    },
    AssociatedWaitHandler {
        handler: oneshot::Receiver<Arc<dyn HandleEventListener>>,
        handle: AssociationHandle,
        queue: VecDeque<Bytes>,
    },
    ListenerReady {
        listener: Arc<dyn HandleEventListener>,
        handle: AssociationHandle,
    },
}

impl ProtocolStateData {
    fn handle(&self) -> Option<&AssociationHandle> {
        match self {
            ProtocolStateData::OutboundUnassociated { .. } => None,
            ProtocolStateData::OutboundUnderlyingAssociated { handle, .. }
            | ProtocolStateData::InboundUnassociated { handle, .. }
            | ProtocolStateData::AssociatedWaitHandler { handle, .. }
            | ProtocolStateData::ListenerReady { handle, .. } => Some(handle),
        }
    }
}

/// Why an association stopped
#[derive(Debug)]
pub(crate) enum Stopped {
    /// Closed on local request
    Local(DisassociateInfo),
    /// Closed by the peer, the physical layer or a protocol failure
    Failed(Error),
}

impl Stopped {
    fn info(&self) -> DisassociateInfo {
        match self {
            Stopped::Local(info) => *info,
            Stopped::Failed(error) => error.disassociate_info(),
        }
    }

    fn into_error(self) -> Error {
        match self {
            Stopped::Local(_) => Error::DisassociatedBeforeHandshake,
            Stopped::Failed(error) => error,
        }
    }
}

/// Outcome of handling one event
pub(crate) enum Step {
    Stay(ProtocolStateData),
    Goto(AssociationState, ProtocolStateData),
    Stop(ProtocolStateData, Stopped),
}

/// Per-association settings resolved by the manager
pub(crate) struct AssociationSettings {
    pub local: HandshakeInfo,
    pub refused_uids: HashSet<u64>,
    pub codec: PduCodec,
    pub heartbeat_interval: Duration,
    pub backoff_interval: Duration,
    pub detector: BoxedFailureDetector,
}

/// Forwards physical handle events into the association's queue
struct Forwarder(mpsc::UnboundedSender<FsmEvent>);

impl HandleEventListener for Forwarder {
    fn notify(&self, event: HandleEvent) {
        let _ = self.0.send(FsmEvent::Inbound(event));
    }
}

/// One association: handshake, heartbeats and payload buffering over a
/// single physical handle
pub(crate) struct Association {
    name: String,
    state: AssociationState,
    local: HandshakeInfo,
    refused_uids: HashSet<u64>,
    codec: PduCodec,
    heartbeat_interval: Duration,
    backoff_interval: Duration,
    detector: BoxedFailureDetector,
    timer: Option<Interval>,
    events: mpsc::UnboundedSender<FsmEvent>,
}

impl Association {
    fn new(
        name: String,
        settings: AssociationSettings,
        state: AssociationState,
    ) -> (Self, mpsc::UnboundedReceiver<FsmEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let association = Association {
            name,
            state,
            local: settings.local,
            refused_uids: settings.refused_uids,
            codec: settings.codec,
            heartbeat_interval: settings.heartbeat_interval,
            backoff_interval: settings.backoff_interval,
            detector: settings.detector,
            timer: None,
            events,
        };
        (association, receiver)
    }

    /// Builds a locally initiated association towards `remote_address`.
    ///
    /// Returns the control sender and the future driving the association.
    pub(crate) fn outbound(
        name: String,
        settings: AssociationSettings,
        transport: Arc<dyn Transport>,
        remote_address: Address,
        pending: PendingResult,
    ) -> (
        mpsc::UnboundedSender<FsmEvent>,
        impl Future<Output = ()> + Send + 'static,
    ) {
        let (association, receiver) = Association::new(name, settings, AssociationState::Closed);
        let control = association.events.clone();
        let data = ProtocolStateData::OutboundUnassociated {
            remote_address,
            pending,
            transport,
        };
        (control, association.run(data, receiver))
    }

    /// Builds an association for a connection accepted by the physical transport
    pub(crate) fn inbound(
        name: String,
        settings: AssociationSettings,
        handle: AssociationHandle,
        listener: Arc<dyn AssociationEventListener>,
    ) -> (
        mpsc::UnboundedSender<FsmEvent>,
        impl Future<Output = ()> + Send + 'static,
    ) {
        let (association, receiver) =
            Association::new(name, settings, AssociationState::WaitHandshake);
        let control = association.events.clone();
        let data = ProtocolStateData::InboundUnassociated { listener, handle };
        (control, association.run(data, receiver))
    }

    async fn run(
        mut self,
        data: ProtocolStateData,
        mut events: mpsc::UnboundedReceiver<FsmEvent>,
    ) {
        debug!(association = %self.name, state = %self.state, "association started");
        let step = self.start(data);
        let mut data = match self.advance(step) {
            ControlFlow::Continue(data) => data,
            ControlFlow::Break(()) => return,
        };

        loop {
            let event = tokio::select! {
                Some(event) = events.recv() => event,
                _ = tick(&mut self.timer) => FsmEvent::HeartbeatTimer,
                registered = registration(&mut data) => registered,
            };
            trace!(association = %self.name, state = %self.state, event = event.kind(), "event");

            let step = self.step(data, event);
            data = match self.advance(step) {
                ControlFlow::Continue(data) => data,
                ControlFlow::Break(()) => return,
            };
        }
    }

    fn advance(&mut self, step: Step) -> ControlFlow<(), ProtocolStateData> {
        match step {
            Step::Stay(data) => ControlFlow::Continue(data),
            Step::Goto(state, data) => {
                debug!(association = %self.name, from = %self.state, to = %state, "state transition");
                self.state = state;
                ControlFlow::Continue(data)
            }
            Step::Stop(data, reason) => {
                self.terminate(data, reason);
                ControlFlow::Break(())
            }
        }
    }

    fn start(&mut self, mut data: ProtocolStateData) -> Step {
        match &mut data {
            ProtocolStateData::OutboundUnassociated {
                remote_address,
                transport,
                ..
            } => {
                self.connect(transport.clone(), remote_address.clone());
                Step::Stay(data)
            }
            ProtocolStateData::InboundUnassociated { handle, .. } => {
                match handle.register_listener(Arc::new(Forwarder(self.events.clone()))) {
                    Ok(()) => Step::Stay(data),
                    Err(e) => Step::Stop(data, Stopped::Failed(e)),
                }
            }
            _ => Step::Stay(data),
        }
    }

    /// Runs the physical connect off the event loop
    fn connect(&self, transport: Arc<dyn Transport>, remote_address: Address) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = transport.associate(remote_address).await;
            if let Err(mpsc::error::SendError(FsmEvent::Connected(Ok(handle)))) =
                events.send(FsmEvent::Connected(result))
            {
                // Association already gone; the connection has no owner.
                handle.disassociate();
            }
        });
    }

    fn step(&mut self, data: ProtocolStateData, event: FsmEvent) -> Step {
        match event {
            FsmEvent::Connected(result) => self.on_connected(data, result),
            FsmEvent::RetryAssociate => self.send_associate(data),
            FsmEvent::Inbound(HandleEvent::InboundPayload(bytes)) => self.on_pdu(data, bytes),
            FsmEvent::Inbound(HandleEvent::Disassociated(info)) => {
                Step::Stop(data, Stopped::Failed(Error::PeerDisassociated(info)))
            }
            FsmEvent::HeartbeatTimer => self.on_heartbeat_timer(data),
            FsmEvent::ListenerRegistered(listener) => self.on_listener_registered(data, listener),
            FsmEvent::ListenerAbandoned => {
                self.send_disassociate(&data, DisassociateInfo::Unknown);
                Step::Stop(data, Stopped::Local(DisassociateInfo::Unknown))
            }
            FsmEvent::Disassociate(info) => {
                if self.state != AssociationState::Closed {
                    self.send_disassociate(&data, info);
                }
                Step::Stop(data, Stopped::Local(info))
            }
        }
    }

    fn on_connected(&mut self, data: ProtocolStateData, result: Result<AssociationHandle>) -> Step {
        match (data, result) {
            (ProtocolStateData::OutboundUnassociated { pending, .. }, Ok(mut handle)) => {
                if let Err(e) = handle.register_listener(Arc::new(Forwarder(self.events.clone()))) {
                    let data = ProtocolStateData::OutboundUnderlyingAssociated { pending, handle };
                    return Step::Stop(data, Stopped::Failed(e));
                }
                self.send_associate(ProtocolStateData::OutboundUnderlyingAssociated {
                    pending,
                    handle,
                })
            }
            (data @ ProtocolStateData::OutboundUnassociated { .. }, Err(e)) => {
                Step::Stop(data, Stopped::Failed(e))
            }
            (data, Ok(handle)) => {
                handle.disassociate();
                Step::Stay(data)
            }
            (data, Err(_)) => Step::Stay(data),
        }
    }

    /// Sends our Associate from `Closed`, retrying after backoff when the
    /// handle refuses the write
    fn send_associate(&mut self, data: ProtocolStateData) -> Step {
        if self.state != AssociationState::Closed {
            return Step::Stay(data);
        }
        let ProtocolStateData::OutboundUnderlyingAssociated { handle, .. } = &data else {
            return Step::Stay(data);
        };

        let pdu = match self.codec.encode_associate(&self.local) {
            Ok(pdu) => pdu,
            Err(e) => return Step::Stop(data, Stopped::Failed(e)),
        };
        if handle.write(pdu) {
            self.start_timer();
            self.detector.heartbeat();
            Step::Goto(AssociationState::WaitHandshake, data)
        } else if handle.is_closed() {
            let error = Error::transport(format!(
                "connection to {} closed before handshake",
                handle.remote_address()
            ));
            Step::Stop(data, Stopped::Failed(error))
        } else {
            trace!(association = %self.name, backoff = ?self.backoff_interval, "associate write refused, retrying");
            let events = self.events.clone();
            let backoff = self.backoff_interval;
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                let _ = events.send(FsmEvent::RetryAssociate);
            });
            Step::Stay(data)
        }
    }

    fn on_pdu(&mut self, data: ProtocolStateData, bytes: Bytes) -> Step {
        let pdu = match self.codec.decode(&bytes) {
            Ok(pdu) => pdu,
            Err(e) => {
                self.send_disassociate(&data, DisassociateInfo::Unknown);
                return Step::Stop(data, Stopped::Failed(e));
            }
        };

        match (self.state, pdu) {
            (_, Pdu::Disassociate(info)) => {
                Step::Stop(data, Stopped::Failed(Error::PeerDisassociated(info)))
            }
            (AssociationState::Closed, pdu) => {
                debug!(association = %self.name, pdu = pdu.kind(), "ignoring PDU before Associate was sent");
                Step::Stay(data)
            }
            (AssociationState::WaitHandshake, Pdu::Associate(info)) => self.on_associate(data, info),
            (AssociationState::WaitHandshake, pdu) => {
                self.send_disassociate(&data, DisassociateInfo::Unknown);
                let error = Error::protocol_violation(format!(
                    "{} received before handshake completed",
                    pdu.kind()
                ));
                Step::Stop(data, Stopped::Failed(error))
            }
            (AssociationState::Open, Pdu::Heartbeat) => {
                self.detector.heartbeat();
                Step::Stay(data)
            }
            (AssociationState::Open, Pdu::Payload(payload)) => {
                // Any traffic counts as a sign of life.
                self.detector.heartbeat();
                Step::Stay(deliver(data, payload))
            }
            (AssociationState::Open, Pdu::Associate(info)) => {
                debug!(association = %self.name, uid = info.uid, "ignoring repeated Associate");
                Step::Stay(data)
            }
        }
    }

    fn on_associate(&mut self, data: ProtocolStateData, peer: HandshakeInfo) -> Step {
        if self.refused_uids.contains(&peer.uid) {
            self.send_disassociate(&data, DisassociateInfo::Quarantined);
            return Step::Stop(data, Stopped::Failed(Error::ForbiddenUid(peer.uid)));
        }

        match data {
            ProtocolStateData::OutboundUnderlyingAssociated { pending, handle } => {
                self.detector.heartbeat();
                let (registration, handler) = oneshot::channel();
                let protocol_handle = ProtocolHandle::new(
                    self.local.origin.clone(),
                    handle.remote_address().clone(),
                    peer,
                    handle.writer(),
                    self.codec,
                    registration,
                    self.events.clone(),
                );
                if pending.send(Ok(protocol_handle)).is_err() {
                    // Dropping the handle abandons the listener slot, which ends us.
                    debug!(association = %self.name, "association requester went away");
                }
                Step::Goto(
                    AssociationState::Open,
                    ProtocolStateData::AssociatedWaitHandler {
                        handler,
                        handle,
                        queue: VecDeque::new(),
                    },
                )
            }
            ProtocolStateData::InboundUnassociated { listener, handle } => {
                match self.codec.encode_associate(&self.local) {
                    Ok(pdu) => {
                        if !handle.write(pdu) {
                            debug!(association = %self.name, "associate reply refused by handle");
                        }
                    }
                    Err(e) => {
                        let data = ProtocolStateData::InboundUnassociated { listener, handle };
                        return Step::Stop(data, Stopped::Failed(e));
                    }
                }
                self.start_timer();
                self.detector.heartbeat();

                let (registration, handler) = oneshot::channel();
                let protocol_handle = ProtocolHandle::new(
                    self.local.origin.clone(),
                    peer.origin.clone(),
                    peer,
                    handle.writer(),
                    self.codec,
                    registration,
                    self.events.clone(),
                );
                listener.notify(InboundAssociation {
                    handle: protocol_handle,
                });
                Step::Goto(
                    AssociationState::Open,
                    ProtocolStateData::AssociatedWaitHandler {
                        handler,
                        handle,
                        queue: VecDeque::new(),
                    },
                )
            }
            data => Step::Stay(data),
        }
    }

    fn on_heartbeat_timer(&mut self, data: ProtocolStateData) -> Step {
        if self.state == AssociationState::Closed {
            return Step::Stay(data);
        }
        if !self.detector.is_available() {
            self.send_disassociate(&data, DisassociateInfo::Unknown);
            return Step::Stop(data, Stopped::Failed(Error::HandshakeTimeout));
        }

        if let Some(handle) = data.handle() {
            match self.codec.encode_heartbeat() {
                Ok(pdu) => {
                    if !handle.write(pdu) {
                        trace!(association = %self.name, "heartbeat dropped by backpressure");
                    }
                }
                Err(e) => warn!(association = %self.name, error = %e, "failed to encode heartbeat"),
            }
        }
        Step::Stay(data)
    }

    fn on_listener_registered(
        &mut self,
        data: ProtocolStateData,
        listener: Arc<dyn HandleEventListener>,
    ) -> Step {
        match data {
            ProtocolStateData::AssociatedWaitHandler { handle, queue, .. } => {
                debug!(association = %self.name, queued = queue.len(), "listener registered");
                for payload in queue {
                    listener.notify(HandleEvent::InboundPayload(payload));
                }
                Step::Stay(ProtocolStateData::ListenerReady { listener, handle })
            }
            data => Step::Stay(data),
        }
    }

    fn send_disassociate(&self, data: &ProtocolStateData, reason: DisassociateInfo) {
        let Some(handle) = data.handle() else {
            return;
        };
        match self.codec.encode_disassociate(reason) {
            Ok(pdu) => {
                if !handle.write(pdu) {
                    trace!(association = %self.name, %reason, "disassociate not written");
                }
            }
            Err(e) => warn!(association = %self.name, error = %e, "failed to encode disassociate"),
        }
    }

    fn start_timer(&mut self) {
        let mut timer = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some(timer);
    }

    fn terminate(&mut self, data: ProtocolStateData, reason: Stopped) {
        self.timer = None;
        let info = reason.info();
        match &reason {
            Stopped::Failed(
                e @ (Error::HandshakeTimeout
                | Error::ForbiddenUid(_)
                | Error::MalformedPdu(_)
                | Error::ProtocolViolation(_)),
            ) => {
                warn!(association = %self.name, state = %self.state, error = %e, "association failed")
            }
            Stopped::Failed(e) => {
                debug!(association = %self.name, state = %self.state, error = %e, "association closed")
            }
            Stopped::Local(reason) => {
                debug!(association = %self.name, state = %self.state, %reason, "association disassociated locally")
            }
        }

        match data {
            ProtocolStateData::OutboundUnassociated { pending, .. } => {
                let _ = pending.send(Err(reason.into_error()));
            }
            ProtocolStateData::OutboundUnderlyingAssociated { pending, handle } => {
                let _ = pending.send(Err(reason.into_error()));
                handle.disassociate();
            }
            ProtocolStateData::InboundUnassociated { handle, .. } => handle.disassociate(),
            ProtocolStateData::AssociatedWaitHandler {
                handler,
                handle,
                queue,
            } => {
                handle.disassociate();
                // The listener may still register later; it then gets the
                // queued payload followed by the disassociation.
                tokio::spawn(async move {
                    if let Ok(listener) = handler.await {
                        for payload in queue {
                            listener.notify(HandleEvent::InboundPayload(payload));
                        }
                        listener.notify(HandleEvent::Disassociated(info));
                    }
                });
            }
            ProtocolStateData::ListenerReady { listener, handle } => {
                handle.disassociate();
                listener.notify(HandleEvent::Disassociated(info));
            }
        }
    }
}

/// Queues or forwards one payload depending on listener readiness
fn deliver(mut data: ProtocolStateData, payload: Bytes) -> ProtocolStateData {
    match &mut data {
        ProtocolStateData::AssociatedWaitHandler { queue, .. } => queue.push_back(payload),
        ProtocolStateData::ListenerReady { listener, .. } => {
            listener.notify(HandleEvent::InboundPayload(payload))
        }
        _ => {}
    }
    data
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolves once the application registers (or abandons) its listener
async fn registration(data: &mut ProtocolStateData) -> FsmEvent {
    match data {
        ProtocolStateData::AssociatedWaitHandler { handler, .. } => match handler.await {
            Ok(listener) => FsmEvent::ListenerRegistered(listener),
            Err(_) => FsmEvent::ListenerAbandoned,
        },
        _ => std::future::pending().await,
    }
}
