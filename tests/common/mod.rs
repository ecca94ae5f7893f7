//! In-process coordination ensemble for integration tests
//!
//! Speaks the real wire protocol over `tokio::io::duplex` streams and keeps a
//! small node tree, with knobs to make the network misbehave.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use zkclient::config::parse_host_port_spec;
use zkclient::error::codes;
use zkclient::proto::{
    self, keeper_state, ConnectRequest, ConnectResponse, CreateRequest, CreateResponse, Empty,
    GetChildrenResponse, GetDataResponse, OpCode, PathWatchRequest, Record, ReplyHeader,
    RequestHeader, SetDataRequest, SetDataResponse, Stat, WatcherEvent, AUTH_XID,
    NOTIFICATION_XID, PING_XID, SESSION_EVENT_TYPE,
};
use zkclient::session::ByteStream;
use zkclient::{ClientConfig, Connector, PeerAddress, SessionEvent, ZkClient, ZkError};

#[derive(Debug, Clone)]
enum Control {
    Drop,
    Frame(Bytes),
}

enum Reply {
    Send(Bytes),
    SendAndClose(Bytes),
    Nothing,
}

struct Node {
    data: Vec<u8>,
    version: i32,
    cversion: i32,
    czxid: i64,
    mzxid: i64,
    ephemeral_owner: i64,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    zxid: i64,
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                version: 0,
                cversion: 0,
                czxid: 0,
                mzxid: 0,
                ephemeral_owner: 0,
            },
        );
        Self { nodes, zxid: 0 }
    }

    fn children(&self, path: &str) -> Result<Vec<String>, i32> {
        if !self.nodes.contains_key(path) {
            return Err(codes::NO_NODE);
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        Ok(self
            .nodes
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(String::from)
            .collect())
    }

    fn stat(&self, path: &str) -> Result<Stat, i32> {
        let node = self.nodes.get(path).ok_or(codes::NO_NODE)?;
        Ok(Stat {
            czxid: node.czxid,
            mzxid: node.mzxid,
            version: node.version,
            cversion: node.cversion,
            ephemeral_owner: node.ephemeral_owner,
            data_length: node.data.len() as i32,
            num_children: self.children(path)?.len() as i32,
            ..Default::default()
        })
    }

    fn create(&mut self, path: &str, data: Vec<u8>, flags: i32, owner: i64) -> Result<String, i32> {
        let parent = self.nodes.get(parent_of(path)).ok_or(codes::NO_NODE)?;
        if parent.ephemeral_owner != 0 {
            return Err(codes::NO_CHILDREN_FOR_EPHEMERALS);
        }
        let actual = if flags & 2 != 0 {
            format!("{}{:010}", path, parent.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(codes::NODE_EXISTS);
        }

        self.zxid += 1;
        let zxid = self.zxid;
        if let Some(parent) = self.nodes.get_mut(parent_of(path)) {
            parent.cversion += 1;
        }
        self.nodes.insert(
            actual.clone(),
            Node {
                data,
                version: 0,
                cversion: 0,
                czxid: zxid,
                mzxid: zxid,
                ephemeral_owner: if flags & 1 != 0 { owner } else { 0 },
            },
        );
        Ok(actual)
    }

    fn set(&mut self, path: &str, data: Vec<u8>, version: i32) -> Result<Stat, i32> {
        let zxid = self.zxid + 1;
        let node = self.nodes.get_mut(path).ok_or(codes::NO_NODE)?;
        if version != -1 && version != node.version {
            return Err(codes::BAD_VERSION);
        }
        node.data = data;
        node.version += 1;
        node.mzxid = zxid;
        self.zxid = zxid;
        self.stat(path)
    }

    fn remove_ephemerals(&mut self, owner: i64) {
        self.nodes.retain(|_, node| node.ephemeral_owner != owner);
    }
}

struct Inner {
    tree: Mutex<Tree>,
    sessions: Mutex<HashMap<i64, Vec<u8>>>,
    next_session: AtomicI64,
    max_timeout_ms: AtomicI32,
    reachable: AtomicBool,
    down: Mutex<HashSet<String>>,
    stalled: AtomicBool,
    deaf: AtomicBool,
    next_error: AtomicI32,
    reject_auth: AtomicBool,
    attempts: Mutex<Vec<String>>,
    requests: AtomicUsize,
    control: broadcast::Sender<Control>,
}

impl Inner {
    fn open_session(&self, request: &ConnectRequest) -> ConnectResponse {
        let mut sessions = self.sessions.lock().unwrap();
        let timeout_ms = request.timeout_ms.min(self.max_timeout_ms.load(Ordering::SeqCst));

        if request.session_id != 0 {
            return match sessions.get(&request.session_id) {
                Some(password) if *password == request.password => ConnectResponse {
                    protocol_version: 0,
                    timeout_ms,
                    session_id: request.session_id,
                    password: password.clone(),
                },
                _ => ConnectResponse::refused(),
            };
        }

        let session_id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let password = [session_id.to_be_bytes(), (!session_id).to_be_bytes()].concat();
        sessions.insert(session_id, password.clone());
        ConnectResponse {
            protocol_version: 0,
            timeout_ms,
            session_id,
            password,
        }
    }

    fn handle(&self, session_id: i64, mut frame: Bytes) -> Reply {
        let Ok(header) = RequestHeader::read_from(&mut frame) else {
            return Reply::Nothing;
        };
        let xid = header.xid;

        if xid == PING_XID {
            return Reply::Send(reply(PING_XID, 0, codes::OK, &Empty));
        }
        if xid == AUTH_XID {
            if self.reject_auth.load(Ordering::SeqCst) {
                return Reply::SendAndClose(reply(AUTH_XID, 0, codes::AUTH_FAILED, &Empty));
            }
            return Reply::Send(reply(AUTH_XID, 0, codes::OK, &Empty));
        }

        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            return Reply::Nothing;
        }
        let injected = self.next_error.swap(0, Ordering::SeqCst);
        if injected != 0 {
            return Reply::Send(reply(xid, 0, injected, &Empty));
        }

        let mut tree = self.tree.lock().unwrap();
        let outcome = match OpCode::from_code(header.op) {
            Some(OpCode::Create) => CreateRequest::read_from(&mut frame)
                .map_err(|_| codes::MARSHALLING_ERROR)
                .and_then(|req| tree.create(&req.path, req.data, req.flags, session_id))
                .map(|path| proto::encode(&CreateResponse { path })),
            Some(OpCode::GetData) => PathWatchRequest::read_from(&mut frame)
                .map_err(|_| codes::MARSHALLING_ERROR)
                .and_then(|req| {
                    let stat = tree.stat(&req.path)?;
                    let data = tree.nodes[&req.path].data.clone();
                    Ok(proto::encode(&GetDataResponse { data, stat }))
                }),
            Some(OpCode::SetData) => SetDataRequest::read_from(&mut frame)
                .map_err(|_| codes::MARSHALLING_ERROR)
                .and_then(|req| tree.set(&req.path, req.data, req.version))
                .map(|stat| proto::encode(&SetDataResponse { stat })),
            Some(OpCode::GetChildren) => PathWatchRequest::read_from(&mut frame)
                .map_err(|_| codes::MARSHALLING_ERROR)
                .and_then(|req| tree.children(&req.path))
                .map(|children| proto::encode(&GetChildrenResponse { children })),
            Some(OpCode::CloseSession) => {
                self.sessions.lock().unwrap().remove(&session_id);
                tree.remove_ephemerals(session_id);
                return Reply::SendAndClose(reply(xid, tree.zxid, codes::OK, &Empty));
            }
            _ => Err(codes::UNIMPLEMENTED),
        };

        let zxid = tree.zxid;
        Reply::Send(match outcome {
            Ok(body) => {
                let mut frame = proto::encode(&ReplyHeader { xid, zxid, err: codes::OK }).to_vec();
                frame.extend_from_slice(&body);
                Bytes::from(frame)
            }
            Err(code) => reply(xid, zxid, code, &Empty),
        })
    }
}

fn reply<R: Record>(xid: i32, zxid: i64, err: i32, body: &R) -> Bytes {
    proto::encode_with_header(&ReplyHeader { xid, zxid, err }, body)
}

async fn serve_connection(
    inner: Arc<Inner>,
    stream: DuplexStream,
    mut control: broadcast::Receiver<Control>,
) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let Some(Ok(frame)) = framed.next().await else {
        return;
    };
    let Ok(request) = proto::decode::<ConnectRequest>(frame.freeze()) else {
        return;
    };
    let response = inner.open_session(&request);
    if framed.send(proto::encode(&response)).await.is_err() || response.is_refused() {
        return;
    }
    let session_id = response.session_id;

    if inner.deaf.load(Ordering::SeqCst) {
        // Hold the connection open without reading from it
        loop {
            match control.recv().await {
                Ok(Control::Drop) | Err(broadcast::error::RecvError::Closed) => return,
                _ => {}
            }
        }
    }

    loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(Ok(frame)) = frame else {
                    return;
                };
                match inner.handle(session_id, frame.freeze()) {
                    Reply::Send(bytes) => {
                        if framed.send(bytes).await.is_err() {
                            return;
                        }
                    }
                    Reply::SendAndClose(bytes) => {
                        let _ = framed.send(bytes).await;
                        return;
                    }
                    Reply::Nothing => {}
                }
            }
            control = control.recv() => match control {
                Ok(Control::Frame(bytes)) => {
                    if framed.send(bytes).await.is_err() {
                        return;
                    }
                }
                Ok(Control::Drop) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}

/// A fake cluster; every peer address reaches the same node tree.
#[derive(Clone)]
pub struct FakeEnsemble {
    inner: Arc<Inner>,
}

impl FakeEnsemble {
    pub fn new() -> Self {
        let (control, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(Tree::new()),
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicI64::new(0x1000),
                max_timeout_ms: AtomicI32::new(40_000),
                reachable: AtomicBool::new(true),
                down: Mutex::new(HashSet::new()),
                stalled: AtomicBool::new(false),
                deaf: AtomicBool::new(false),
                next_error: AtomicI32::new(0),
                reject_auth: AtomicBool::new(false),
                attempts: Mutex::new(Vec::new()),
                requests: AtomicUsize::new(0),
                control,
            }),
        }
    }

    /// Client with fast reconnects against this ensemble.
    pub fn client(&self, config: ClientConfig) -> ZkClient {
        ZkClient::with_connector(config, Arc::new(self.clone())).unwrap()
    }

    pub async fn connected_client(&self) -> ZkClient {
        let client = self.client(config("zk1:2181"));
        client.wait_until_connected(Duration::from_secs(5)).await.unwrap();
        client
    }

    /// When false, every connection attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Hosts whose connection attempts fail.
    pub fn set_down(&self, hosts: &[&str]) {
        *self.inner.down.lock().unwrap() = hosts.iter().map(|h| h.to_string()).collect();
    }

    /// Abruptly close every open connection.
    pub fn drop_connections(&self) {
        let _ = self.inner.control.send(Control::Drop);
    }

    /// Swallow requests without answering; pings are still answered.
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Forget all sessions so re-establishment is refused.
    pub fn forget_sessions(&self) {
        let ids: Vec<i64> = self.inner.sessions.lock().unwrap().drain().map(|(id, _)| id).collect();
        let mut tree = self.inner.tree.lock().unwrap();
        for id in ids {
            tree.remove_ephemerals(id);
        }
    }

    /// Forget all sessions and tell connected clients they expired.
    pub fn expire_sessions(&self) {
        self.forget_sessions();
        self.push(reply(
            NOTIFICATION_XID,
            -1,
            codes::OK,
            &WatcherEvent {
                event_type: SESSION_EVENT_TYPE,
                state: keeper_state::EXPIRED,
                path: String::new(),
            },
        ));
    }

    /// Connections opened from now on complete the handshake and then never
    /// read another byte.
    pub fn set_deaf(&self, deaf: bool) {
        self.inner.deaf.store(deaf, Ordering::SeqCst);
    }

    /// Answer the next request with `code` instead of executing it.
    pub fn fail_next_request(&self, code: i32) {
        self.inner.next_error.store(code, Ordering::SeqCst);
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.inner.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn set_max_session_timeout_ms(&self, timeout_ms: i32) {
        self.inner.max_timeout_ms.store(timeout_ms, Ordering::SeqCst);
    }

    /// Push a node notification to every connected client.
    pub fn notify(&self, event_type: i32, path: &str) {
        self.push(reply(
            NOTIFICATION_XID,
            -1,
            codes::OK,
            &WatcherEvent {
                event_type,
                state: keeper_state::SYNC_CONNECTED,
                path: path.to_string(),
            },
        ));
    }

    /// Send a reply for a request nobody made.
    pub fn push_unmatched_reply(&self, xid: i32) {
        self.push(reply(xid, 0, codes::OK, &Empty));
    }

    fn push(&self, frame: Bytes) {
        let _ = self.inner.control.send(Control::Frame(frame));
    }

    /// Peers in the order connection attempts were made.
    pub fn attempts(&self) -> Vec<String> {
        self.inner.attempts.lock().unwrap().clone()
    }

    /// Requests received, excluding handshakes, pings and auth packets.
    pub fn request_count(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }

    pub fn node(&self, path: &str) -> Option<(Vec<u8>, i32)> {
        let tree = self.inner.tree.lock().unwrap();
        tree.nodes.get(path).map(|n| (n.data.clone(), n.version))
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for FakeEnsemble {
    async fn connect(
        &self,
        peer: &PeerAddress,
        _timeout: Duration,
    ) -> Result<Box<dyn ByteStream>, ZkError> {
        self.inner.attempts.lock().unwrap().push(peer.to_string());

        let down = self.inner.down.lock().unwrap().contains(&peer.host);
        if down || !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(ZkError::Connection(format!("{} unreachable", peer)));
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let control = self.inner.control.subscribe();
        tokio::spawn(serve_connection(Arc::clone(&self.inner), server, control));
        Ok(Box::new(client))
    }
}

/// Config with short timers suited to tests.
pub fn config(servers: &str) -> ClientConfig {
    ClientConfig {
        servers: parse_host_port_spec(servers).unwrap(),
        session_timeout_ms: 3_000,
        connect_timeout_ms: 500,
        reconnect_backoff_ms: 20,
        ..Default::default()
    }
}

/// Wait for the first event matching `pred`.
pub async fn next_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    timeout: Duration,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
