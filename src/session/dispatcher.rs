//! Request dispatch
//!
//! Single responsibility: Correlate outgoing requests with incoming replies.
//!
//! The dispatcher is owned by the session task and is never shared; callers
//! only ever hold the receiving end of their completion slot.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use super::events::{EventBus, SessionEvent, WatchedEvent};
use crate::error::{check_result_code, codes, is_known_code, ZkError};
use crate::proto::{
    self, keeper_state, OpCode, ReplyHeader, RequestHeader, WatcherEvent, AUTH_XID,
    NOTIFICATION_XID, PING_XID, SESSION_EVENT_TYPE,
};

/// Where a caller waits for its reply body.
pub type Completion = oneshot::Sender<Result<Bytes, ZkError>>;

/// A request that has been accepted but not yet answered.
pub struct PendingRequest {
    pub op: OpCode,
    /// Submission order; xids wrap so they cannot be used for this
    seq: u64,
    /// Header and body, kept so the request can be replayed after a reconnect
    frame: Bytes,
    completion: Completion,
}

/// What an inbound frame turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Resolved { xid: i32, op: OpCode },
    /// The caller got an error, but the reply carried an unknown code or
    /// a body that does not parse; the connection cannot be trusted
    ProtocolViolation { xid: i32, code: i32 },
    Pong,
    Notification,
    AuthAccepted,
    AuthRejected,
    SessionExpired,
}

pub struct Dispatcher {
    next_xid: i32,
    next_seq: u64,
    pending: HashMap<i32, PendingRequest>,
    last_zxid: i64,
    events: Arc<EventBus>,
}

impl Dispatcher {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            next_xid: 1,
            next_seq: 0,
            pending: HashMap::new(),
            last_zxid: 0,
            events,
        }
    }

    /// Register a request and return the frame to put on the wire.
    pub fn enqueue(&mut self, op: OpCode, body: Bytes, completion: Completion) -> Bytes {
        let xid = self.allocate_xid();
        let seq = self.next_seq;
        self.next_seq += 1;

        let header = RequestHeader { xid, op: op.code() };
        let mut frame = bytes::BytesMut::with_capacity(8 + body.len());
        frame.extend_from_slice(&proto::encode(&header));
        frame.extend_from_slice(&body);
        let frame = frame.freeze();

        trace!(xid = xid, op = ?op, "Request queued");
        self.pending.insert(
            xid,
            PendingRequest {
                op,
                seq,
                frame: frame.clone(),
                completion,
            },
        );
        frame
    }

    /// Caller ids are positive, strictly increasing, and never collide with
    /// a request that is still pending.
    fn allocate_xid(&mut self) -> i32 {
        loop {
            let xid = self.next_xid;
            self.next_xid = if xid == i32::MAX { 1 } else { xid + 1 };
            if !self.pending.contains_key(&xid) {
                return xid;
            }
        }
    }

    /// Route one inbound frame.
    ///
    /// An `Err` means the peer violated the protocol and the connection
    /// must be abandoned.
    pub fn on_response_frame(&mut self, mut frame: Bytes) -> Result<Inbound, ZkError> {
        let header: ReplyHeader = proto::Record::read_from(&mut frame)?;
        if header.zxid > self.last_zxid {
            self.last_zxid = header.zxid;
        }

        match header.xid {
            NOTIFICATION_XID => {
                let event: WatcherEvent = proto::Record::read_from(&mut frame)?;
                if event.event_type == SESSION_EVENT_TYPE {
                    match event.state {
                        keeper_state::EXPIRED => return Ok(Inbound::SessionExpired),
                        keeper_state::AUTH_FAILED => return Ok(Inbound::AuthRejected),
                        _ => {}
                    }
                }
                debug!(path = %event.path, event_type = event.event_type, "Notification received");
                self.events.emit(SessionEvent::Watch(WatchedEvent::from(event)));
                Ok(Inbound::Notification)
            }
            PING_XID => Ok(Inbound::Pong),
            AUTH_XID => {
                if header.err == codes::OK {
                    Ok(Inbound::AuthAccepted)
                } else {
                    debug!(err = header.err, "Authentication rejected");
                    Ok(Inbound::AuthRejected)
                }
            }
            xid => {
                let Some(request) = self.pending.remove(&xid) else {
                    error!(xid = xid, "Reply for unknown request");
                    return Err(ZkError::protocol(format!("reply for unknown xid {}", xid)));
                };
                let result = check_result_code(header.err).and_then(|()| {
                    proto::check_reply_body(request.op, &frame)?;
                    Ok(frame)
                });
                debug!(xid = xid, op = ?request.op, err = header.err, "Reply received");

                let violation = !is_known_code(header.err) || (result.is_err() && header.err == codes::OK);
                if violation {
                    warn!(xid = xid, op = ?request.op, err = header.err, "Malformed reply");
                }
                // The caller may have stopped waiting
                let _ = request.completion.send(result);

                if violation {
                    Ok(Inbound::ProtocolViolation { xid, code: header.err })
                } else {
                    Ok(Inbound::Resolved { xid, op: request.op })
                }
            }
        }
    }

    /// Frames of every pending request, oldest first.
    pub fn replay(&self) -> Vec<Bytes> {
        let mut pending: Vec<&PendingRequest> = self.pending.values().collect();
        pending.sort_by_key(|p| p.seq);
        pending.into_iter().map(|p| p.frame.clone()).collect()
    }

    /// Resolve every pending request with `err`.
    pub fn fail_all(&mut self, err: ZkError) {
        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), error = %err, "Failing pending requests");
        }
        for (_, request) in std::mem::take(&mut self.pending) {
            let _ = request.completion.send(Err(err.clone()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn last_zxid(&self) -> i64 {
        self.last_zxid
    }
}
