//! Session Manager
//!
//! Single responsibility: Keep one session alive across peers and carry
//! requests over whatever connection is current.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐   Command::Submit / Close   ┌───────────────────────────┐
//! │ SessionManager (handles) │ ──────── mpsc ────────────► │ SessionTask (one per      │
//! │  - submit() waits on a   │                             │ session, owns everything) │
//! │    oneshot slot          │ ◄─────── oneshot ────────── │  - Transport              │
//! │  - state() via watch     │ ◄─────── watch ──────────── │  - Dispatcher (pending)   │
//! └──────────────────────────┘                             │  - ServerSelector         │
//!                                                          └───────────────────────────┘
//! ```
//!
//! The task is the only writer of session state and of the pending table.
//! Callers never touch either; they hand a completion slot over the channel
//! and wait on it. Frames go out through a per-connection writer task, so a
//! peer that stops reading never stalls timers or `close()`.
//!
//! # Reconnection Policy
//!
//! When a connection dies:
//! 1. State goes back to `Connecting`; pending requests stay pending
//! 2. Peers are tried in selector order with a jittered backoff, presenting
//!    the existing session id and password
//! 3. On success every pending request is resent in submission order
//! 4. If the session timeout passes first, pending requests fail with
//!    `SessionTimeout` and the session is `Expired` for good

use bytes::Bytes;
use futures_util::SinkExt;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::dispatcher::{Completion, Dispatcher, Inbound};
use super::events::{EventBus, SessionEvent};
use super::selector::ServerSelector;
use super::state::{SessionIdentity, SessionState};
use super::transport::{recv_frame, send_frame, Connector, FrameSink, FrameStream, Transport};
use crate::config::{ClientConfig, PeerAddress};
use crate::error::ZkError;
use crate::proto::{
    self, AuthPacket, ConnectRequest, ConnectResponse, Empty, OpCode, RequestHeader, AUTH_XID,
    PING_XID,
};

const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

/// Requests from handles to the session task.
enum Command {
    Submit {
        op: OpCode,
        body: Bytes,
        completion: Completion,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running session.
///
/// Cheap to clone. The session closes when `close()` is called or when the
/// last handle is dropped.
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    identity: watch::Receiver<Option<SessionIdentity>>,
    events: Arc<EventBus>,
}

impl SessionManager {
    /// Spawn the session task and start connecting.
    ///
    /// Returns immediately; requests submitted before the first handshake
    /// completes are held until it does.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - No Tokio runtime on the calling thread
    pub fn start(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self, ZkError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ZkError::Configuration("zkclient must be started inside a Tokio runtime".into())
        })?;

        let selector = ServerSelector::new(config.servers.clone(), config.deterministic_order)?;
        let (commands_tx, commands_rx) = mpsc::channel(config.max_pending_requests);
        let (state_tx, state_rx) = watch::channel(SessionState::Init);
        let (identity_tx, identity_rx) = watch::channel(None);
        let events = Arc::new(EventBus::new());

        info!(
            servers = config.servers.len(),
            timeout_ms = config.session_timeout_ms,
            deterministic = config.deterministic_order,
            "Starting session"
        );

        let task = SessionTask {
            dispatcher: Dispatcher::new(Arc::clone(&events)),
            events: Arc::clone(&events),
            config,
            connector,
            selector,
            identity: None,
            commands: commands_rx,
            state: state_tx,
            identity_tx,
        };
        runtime.spawn(task.run());

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            identity: identity_rx,
            events,
        })
    }

    /// Send one request and wait for its reply body.
    ///
    /// Waits across reconnects; only the session timeout bounds how long a
    /// request can wait without a healthy connection.
    pub async fn submit(&self, op: OpCode, body: Bytes) -> Result<Bytes, ZkError> {
        if let Some(err) = self.state().rejection() {
            return Err(err);
        }

        let (completion, slot) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                op,
                body,
                completion,
            })
            .await
            .map_err(|_| ZkError::SessionClosed)?;

        // A dropped slot means the task is gone
        slot.await.map_err(|_| ZkError::SessionClosed)?
    }

    /// Close the session. Idempotent.
    ///
    /// Every outstanding request fails with `SessionClosed`.
    pub async fn close(&self) -> Result<(), ZkError> {
        if self.state() == SessionState::Closed {
            return Ok(());
        }
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Close { done }).await.is_err() {
            // Task already finished
            return Ok(());
        }
        let _ = finished.await;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn session_id(&self) -> Option<i64> {
        self.identity.borrow().as_ref().map(|i| i.session_id)
    }

    pub fn negotiated_timeout(&self) -> Option<Duration> {
        self.identity.borrow().as_ref().map(|i| i.negotiated_timeout)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Wait until the session reaches `target`.
    ///
    /// Fails early with the state's error if the session ends up in a
    /// different terminal state.
    pub async fn wait_for_state(&self, target: SessionState, timeout: Duration) -> Result<(), ZkError> {
        let mut state = self.state.clone();
        let wait = async move {
            loop {
                let current = *state.borrow_and_update();
                if current == target {
                    return Ok(());
                }
                if let Some(err) = current.rejection() {
                    return Err(err);
                }
                if state.changed().await.is_err() {
                    return Err(ZkError::SessionClosed);
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ZkError::Connection(format!("session did not reach {} within {:?}", target, timeout))
        })?
    }
}

/// How the task leaves the connected/connecting cycle.
enum End {
    Expired,
    AuthFailed,
    Closed(Option<oneshot::Sender<()>>),
}

/// Outcome of waiting on something while disconnected.
enum Waited<T> {
    Done(T),
    Expired,
    Closed(Option<oneshot::Sender<()>>),
}

enum Handshake {
    Established(Transport, SessionIdentity),
    /// The server no longer knows the presented session
    Refused,
}

struct SessionTask {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    selector: ServerSelector,
    identity: Option<SessionIdentity>,
    dispatcher: Dispatcher,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<SessionState>,
    identity_tx: watch::Sender<Option<SessionIdentity>>,
    events: Arc<EventBus>,
}

impl SessionTask {
    async fn run(mut self) {
        self.set_state(SessionState::Connecting);
        let mut window_start = Instant::now();

        let end = loop {
            let (transport, identity) = match self.reconnect(window_start).await {
                Ok(established) => established,
                Err(end) => break end,
            };
            match self.serve(transport, identity).await {
                Some(end) => break end,
                None => {
                    window_start = Instant::now();
                    self.set_state(SessionState::Connecting);
                }
            }
        };

        match end {
            End::Expired => self.terminate(SessionState::Expired).await,
            End::AuthFailed => self.terminate(SessionState::AuthFailed).await,
            End::Closed(done) => self.shutdown(done),
        }
    }

    /// Connect to the next reachable peer before the session window closes.
    async fn reconnect(
        &mut self,
        window_start: Instant,
    ) -> Result<(Transport, SessionIdentity), End> {
        let window = self
            .identity
            .as_ref()
            .map(|i| i.negotiated_timeout)
            .unwrap_or_else(|| self.config.session_timeout());
        let mut deadline = window_start + window;
        let mut attempt: u32 = 0;

        loop {
            let peer = self.selector.next().clone();
            attempt += 1;
            debug!(peer = %peer, attempt = attempt, "Connection attempt");

            let handshake = establish(
                Arc::clone(&self.connector),
                peer.clone(),
                self.connect_request(),
                self.config.connect_timeout(),
                self.config.max_frame_length(),
            );

            let failure = match self.while_disconnected(handshake, deadline).await {
                Waited::Done(Ok(Handshake::Established(transport, identity))) => {
                    self.adopt(&peer, identity.clone());
                    return Ok((transport, identity));
                }
                Waited::Done(Ok(Handshake::Refused)) => match self.identity.take() {
                    Some(old) => {
                        warn!(
                            peer = %peer,
                            session_id = %format!("{:#x}", old.session_id),
                            "Server refused to re-establish session, starting a new one"
                        );
                        self.identity_tx.send_replace(None);
                        self.dispatcher.fail_all(ZkError::SessionTimeout);
                        self.events.emit(SessionEvent::Lost {
                            session_id: old.session_id,
                        });
                        deadline = Instant::now() + self.config.session_timeout();
                        continue;
                    }
                    None => ZkError::Connection(format!("{} refused a new session", peer)),
                },
                Waited::Done(Err(e)) => e,
                Waited::Expired => return Err(End::Expired),
                Waited::Closed(done) => return Err(End::Closed(done)),
            };

            warn!(peer = %peer, attempt = attempt, error = %failure, "Connection attempt failed");
            match self
                .while_disconnected(tokio::time::sleep(self.backoff(attempt)), deadline)
                .await
            {
                Waited::Done(()) => {}
                Waited::Expired => return Err(End::Expired),
                Waited::Closed(done) => return Err(End::Closed(done)),
            }
        }
    }

    /// Drive `work` while still accepting commands.
    ///
    /// Submitted requests are queued and go out after the next handshake.
    async fn while_disconnected<F: Future>(&mut self, work: F, deadline: Instant) -> Waited<F::Output> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                out = &mut work => return Waited::Done(out),
                _ = sleep_until(deadline) => {
                    warn!(pending = self.dispatcher.pending_count(), "Session timeout elapsed while disconnected");
                    return Waited::Expired;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Submit { op, body, completion }) => {
                        self.dispatcher.enqueue(op, body, completion);
                    }
                    Some(Command::Close { done }) => return Waited::Closed(Some(done)),
                    None => return Waited::Closed(None),
                },
            }
        }
    }

    /// Pump frames for one healthy connection.
    ///
    /// Returns `None` when the connection is lost and the session should
    /// reconnect, or how the session ended.
    async fn serve(&mut self, transport: Transport, identity: SessionIdentity) -> Option<End> {
        let peer = transport.peer().clone();
        let (sink, mut stream) = transport.split();
        let mut writer = Writer::spawn(sink, peer.clone());
        self.set_state(SessionState::Connected);

        if let Some(auth) = &self.config.auth {
            let packet = AuthPacket {
                auth_type: 0,
                scheme: auth.scheme.clone(),
                auth: auth.credentials.as_bytes().to_vec(),
            };
            let header = RequestHeader {
                xid: AUTH_XID,
                op: OpCode::Auth.code(),
            };
            writer.send(proto::encode_with_header(&header, &packet));
        }

        let replay = self.dispatcher.replay();
        if !replay.is_empty() {
            info!(peer = %peer, count = replay.len(), "Resending pending requests");
        }
        for frame in replay {
            writer.send(frame);
        }

        let read_timeout = identity.read_timeout();
        let ping_interval = identity.ping_interval().max(MIN_PING_INTERVAL);
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                // Whatever the server already sent is handled before a
                // failed writer is noticed
                biased;

                frame = recv_frame(&mut stream) => match frame {
                    Ok(Some(frame)) => {
                        last_heard = Instant::now();
                        match self.dispatcher.on_response_frame(frame) {
                            Ok(Inbound::AuthRejected) => {
                                error!(peer = %peer, "Server rejected credentials");
                                return Some(End::AuthFailed);
                            }
                            Ok(Inbound::SessionExpired) => {
                                warn!(peer = %peer, "Server expired the session");
                                return Some(End::Expired);
                            }
                            Ok(Inbound::ProtocolViolation { xid, code }) => {
                                error!(peer = %peer, xid = xid, code = code, "Unrecognized reply, dropping connection");
                                return None;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(peer = %peer, error = %e, "Protocol violation, dropping connection");
                                return None;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!(peer = %peer, "Peer closed the connection");
                        return None;
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Connection lost");
                        return None;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Submit { op, body, completion }) => {
                        let frame = self.dispatcher.enqueue(op, body, completion);
                        writer.send(frame);
                    }
                    Some(Command::Close { done }) => {
                        self.close_remote(&mut writer, &mut stream, read_timeout).await;
                        return Some(End::Closed(Some(done)));
                    }
                    None => {
                        self.close_remote(&mut writer, &mut stream, read_timeout).await;
                        return Some(End::Closed(None));
                    }
                },
                _ = ping.tick() => {
                    let header = RequestHeader { xid: PING_XID, op: OpCode::Ping.code() };
                    writer.send(proto::encode_with_header(&header, &Empty));
                }
                _ = &mut writer.task => {
                    warn!(peer = %peer, "Connection lost while sending");
                    return None;
                }
                _ = sleep_until(last_heard + read_timeout) => {
                    warn!(
                        peer = %peer,
                        timeout_ms = read_timeout.as_millis() as u64,
                        "Nothing heard from server within read timeout"
                    );
                    return None;
                }
            }
        }
    }

    /// Fail local waiters, then tell the server the session is over.
    ///
    /// Everything after failing the waiters is bounded by `wait`.
    async fn close_remote(&mut self, writer: &mut Writer, stream: &mut FrameStream, wait: Duration) {
        self.set_state(SessionState::Closed);
        self.dispatcher.fail_all(ZkError::SessionClosed);
        let deadline = Instant::now() + wait;

        let (completion, _) = oneshot::channel();
        let frame = self
            .dispatcher
            .enqueue(OpCode::CloseSession, Bytes::new(), completion);
        writer.send(frame);

        let dispatcher = &mut self.dispatcher;
        let acknowledged = timeout_at(deadline, async {
            while let Ok(Some(frame)) = recv_frame(stream).await {
                if let Ok(Inbound::Resolved {
                    xid,
                    op: OpCode::CloseSession,
                }) = dispatcher.on_response_frame(frame)
                {
                    debug!(xid = xid, "Server acknowledged close");
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        debug!(acknowledged = acknowledged, "Close request finished");

        writer.finish(deadline).await;
    }

    /// Session ended for good; answer everything with the state's error
    /// until the caller closes.
    async fn terminate(mut self, state: SessionState) {
        let err = state.rejection().unwrap_or(ZkError::SessionClosed);
        warn!(state = %state, pending = self.dispatcher.pending_count(), "Session terminated");

        self.set_state(state);
        self.forget_identity();
        self.dispatcher.fail_all(err.clone());

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Submit { completion, .. } => {
                    let _ = completion.send(Err(err.clone()));
                }
                Command::Close { done } => return self.shutdown(Some(done)),
            }
        }
        self.shutdown(None)
    }

    fn shutdown(mut self, done: Option<oneshot::Sender<()>>) {
        self.set_state(SessionState::Closed);
        self.forget_identity();
        self.dispatcher.fail_all(ZkError::SessionClosed);
        info!("Session closed");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn adopt(&mut self, peer: &PeerAddress, identity: SessionIdentity) {
        let renewed = self
            .identity
            .as_ref()
            .is_some_and(|old| old.session_id == identity.session_id);

        info!(
            peer = %peer,
            session_id = %format!("{:#x}", identity.session_id),
            timeout_ms = identity.negotiated_timeout.as_millis() as u64,
            renewed = renewed,
            "Session established"
        );
        self.events.emit(SessionEvent::Established {
            session_id: identity.session_id,
            negotiated_timeout: identity.negotiated_timeout,
            peer: peer.clone(),
            renewed,
        });

        self.identity_tx.send_replace(Some(identity.clone()));
        self.identity = Some(identity);
    }

    fn forget_identity(&mut self) {
        self.identity = None;
        self.identity_tx.send_replace(None);
    }

    fn connect_request(&self) -> ConnectRequest {
        let (session_id, password) = match &self.identity {
            Some(identity) => (identity.session_id, identity.password().to_vec()),
            None => (0, vec![0; 16]),
        };
        ConnectRequest {
            protocol_version: 0,
            last_zxid_seen: self.dispatcher.last_zxid(),
            timeout_ms: self.config.session_timeout_ms as i32,
            session_id,
            password,
        }
    }

    /// Base delay, doubled for each full pass over the peer list that has
    /// failed, plus up to 50% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let passes = (attempt as usize / self.selector.len()).min(4) as u32;
        let delay = self.config.reconnect_backoff() * 2u32.pow(passes);
        let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
        delay + Duration::from_millis(jitter_ms)
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Session state changed");
            self.events.emit(SessionEvent::StateChanged { state });
        }
    }
}

/// Send half of one connection, drained by its own task.
struct Writer {
    frames: Option<mpsc::UnboundedSender<Bytes>>,
    task: JoinHandle<()>,
}

impl Writer {
    fn spawn(mut sink: FrameSink, peer: PeerAddress) -> Self {
        let (frames, mut queue) = mpsc::unbounded_channel::<Bytes>();
        let task = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(e) = send_frame(&mut sink, frame).await {
                    debug!(peer = %peer, error = %e, "Writer stopped");
                    return;
                }
            }
            let _ = sink.close().await;
        });
        Self {
            frames: Some(frames),
            task,
        }
    }

    /// Queue a frame behind everything already queued.
    ///
    /// A writer that has stopped drops the frame; the session loop sees the
    /// stopped task and reconnects, and pending requests are replayed.
    fn send(&self, frame: Bytes) {
        if let Some(frames) = &self.frames {
            let _ = frames.send(frame);
        }
    }

    /// Flush what is queued and shut the sink, giving up at `deadline`.
    async fn finish(&mut self, deadline: Instant) {
        self.frames = None;
        if timeout_at(deadline, &mut self.task).await.is_err() {
            debug!("Writer did not drain before close");
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Connect and complete the session handshake within `timeout`.
async fn establish(
    connector: Arc<dyn Connector>,
    peer: PeerAddress,
    request: ConnectRequest,
    timeout: Duration,
    max_frame_length: usize,
) -> Result<Handshake, ZkError> {
    tokio::time::timeout(
        timeout,
        handshake(connector.as_ref(), &peer, request, timeout, max_frame_length),
    )
    .await
    .map_err(|_| ZkError::Connection(format!("handshake with {} timed out", peer)))?
}

async fn handshake(
    connector: &dyn Connector,
    peer: &PeerAddress,
    request: ConnectRequest,
    timeout: Duration,
    max_frame_length: usize,
) -> Result<Handshake, ZkError> {
    let mut transport = Transport::connect(connector, peer, timeout, max_frame_length).await?;
    transport.send(proto::encode(&request)).await?;

    let response: ConnectResponse = proto::decode(transport.recv_frame().await?)?;
    if response.is_refused() {
        transport.close().await;
        return Ok(Handshake::Refused);
    }

    let identity = SessionIdentity::new(
        response.session_id,
        response.password,
        Duration::from_millis(response.timeout_ms as u64),
    );
    Ok(Handshake::Established(transport, identity))
}
