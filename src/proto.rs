//! Coordination Wire Protocol
//!
//! Single responsibility: Encode and decode jute records.
//!
//! # Wire Format
//!
//! Every frame is a 4-byte big-endian length followed by the payload. The
//! length prefix is handled by the transport; this module only sees payloads.
//!
//! ## Handshake (no header)
//! ```text
//! ConnectRequest  { protocol_version: i32, last_zxid_seen: i64, timeout_ms: i32,
//!                   session_id: i64, password: buffer }
//! ConnectResponse { protocol_version: i32, timeout_ms: i32, session_id: i64,
//!                   password: buffer }
//! ```
//!
//! ## Requests and replies
//! ```text
//! RequestHeader { xid: i32, op: i32 }            + request body
//! ReplyHeader   { xid: i32, zxid: i64, err: i32 } + reply body (only when err == 0)
//! ```
//!
//! Primitive encodings: `i32`/`i64` big-endian, `bool` one byte, `buffer` and
//! `string` as an `i32` length (`-1` for null) followed by the bytes, vectors
//! as an `i32` count followed by the items.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ZkError;

/// Correlation id of server-pushed notifications.
pub const NOTIFICATION_XID: i32 = -1;
/// Correlation id of ping requests and replies.
pub const PING_XID: i32 = -2;
/// Correlation id of authentication packets and their replies.
pub const AUTH_XID: i32 = -4;

/// Operation codes understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Create,
    GetData,
    SetData,
    GetChildren,
    Ping,
    CloseSession,
    Auth,
}

impl OpCode {
    pub fn code(self) -> i32 {
        match self {
            OpCode::Create => 1,
            OpCode::GetData => 4,
            OpCode::SetData => 5,
            OpCode::GetChildren => 8,
            OpCode::Ping => 11,
            OpCode::CloseSession => -11,
            OpCode::Auth => 100,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => OpCode::Create,
            4 => OpCode::GetData,
            5 => OpCode::SetData,
            8 => OpCode::GetChildren,
            11 => OpCode::Ping,
            -11 => OpCode::CloseSession,
            100 => OpCode::Auth,
            _ => return None,
        })
    }
}

/// Session states carried by session notifications.
pub mod keeper_state {
    pub const DISCONNECTED: i32 = 0;
    pub const SYNC_CONNECTED: i32 = 3;
    pub const AUTH_FAILED: i32 = 4;
    pub const EXPIRED: i32 = -112;
}

/// Notification type used for session-level (pathless) events.
pub const SESSION_EVENT_TYPE: i32 = -1;

/// A jute record: a fixed sequence of fields with a known encoding.
pub trait Record: Sized {
    fn write_to(&self, buf: &mut BytesMut);
    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError>;
}

/// Encode a single record (handshake frames).
pub fn encode<R: Record>(record: &R) -> Bytes {
    let mut buf = BytesMut::new();
    record.write_to(&mut buf);
    buf.freeze()
}

/// Encode a header followed by a body.
pub fn encode_with_header<H: Record, R: Record>(header: &H, body: &R) -> Bytes {
    let mut buf = BytesMut::new();
    header.write_to(&mut buf);
    body.write_to(&mut buf);
    buf.freeze()
}

/// Decode one record from the front of `bytes`.
///
/// Trailing bytes are left unread; newer servers append optional fields.
pub fn decode<R: Record>(mut bytes: Bytes) -> Result<R, ZkError> {
    R::read_from(&mut bytes)
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

fn need(buf: &Bytes, n: usize, what: &str) -> Result<(), ZkError> {
    if buf.remaining() < n {
        return Err(ZkError::protocol(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_i32(buf: &mut Bytes) -> Result<i32, ZkError> {
    need(buf, 4, "int")?;
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut Bytes) -> Result<i64, ZkError> {
    need(buf, 8, "long")?;
    Ok(buf.get_i64())
}

pub fn get_bool(buf: &mut Bytes) -> Result<bool, ZkError> {
    need(buf, 1, "bool")?;
    Ok(buf.get_u8() != 0)
}

/// A length-prefixed buffer; a negative length encodes null, read as empty.
pub fn get_buffer(buf: &mut Bytes) -> Result<Vec<u8>, ZkError> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(Vec::new());
    }
    let len = len as usize;
    need(buf, len, "buffer")?;
    Ok(buf.split_to(len).to_vec())
}

pub fn get_string(buf: &mut Bytes) -> Result<String, ZkError> {
    let raw = get_buffer(buf)?;
    String::from_utf8(raw).map_err(|_| ZkError::protocol("string is not valid UTF-8"))
}

fn get_vec<T>(
    buf: &mut Bytes,
    mut item: impl FnMut(&mut Bytes) -> Result<T, ZkError>,
) -> Result<Vec<T>, ZkError> {
    let count = get_i32(buf)?;
    if count < 0 {
        return Ok(Vec::new());
    }
    // Each item takes at least 4 bytes; refuse counts the frame cannot hold.
    need(buf, (count as usize).saturating_mul(4), "vector")?;
    (0..count).map(|_| item(buf)).collect()
}

pub fn put_buffer(buf: &mut BytesMut, data: &[u8]) {
    buf.put_i32(data.len() as i32);
    buf.put_slice(data);
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_buffer(buf, s.as_bytes());
}

fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol_version: i32,
    pub last_zxid_seen: i64,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: Vec<u8>,
}

impl Record for ConnectRequest {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32(self.protocol_version);
        buf.put_i64(self.last_zxid_seen);
        buf.put_i32(self.timeout_ms);
        buf.put_i64(self.session_id);
        put_buffer(buf, &self.password);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            protocol_version: get_i32(buf)?,
            last_zxid_seen: get_i64(buf)?,
            timeout_ms: get_i32(buf)?,
            session_id: get_i64(buf)?,
            password: get_buffer(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    /// Negotiated timeout; `<= 0` means the presented session was refused.
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: Vec<u8>,
}

impl ConnectResponse {
    /// The reply a server sends when it will not re-establish a session.
    pub fn refused() -> Self {
        Self {
            protocol_version: 0,
            timeout_ms: 0,
            session_id: 0,
            password: vec![0; 16],
        }
    }

    pub fn is_refused(&self) -> bool {
        self.timeout_ms <= 0
    }
}

impl Record for ConnectResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32(self.protocol_version);
        buf.put_i32(self.timeout_ms);
        buf.put_i64(self.session_id);
        put_buffer(buf, &self.password);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            protocol_version: get_i32(buf)?,
            timeout_ms: get_i32(buf)?,
            session_id: get_i64(buf)?,
            password: get_buffer(buf)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub xid: i32,
    pub op: i32,
}

impl Record for RequestHeader {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_i32(self.op);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            xid: get_i32(buf)?,
            op: get_i32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: i32,
    pub zxid: i64,
    pub err: i32,
}

impl Record for ReplyHeader {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_i64(self.zxid);
        buf.put_i32(self.err);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            xid: get_i32(buf)?,
            zxid: get_i64(buf)?,
            err: get_i32(buf)?,
        })
    }
}

/// Bodyless requests (ping, close) and bodyless replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Empty;

impl Record for Empty {
    fn write_to(&self, _buf: &mut BytesMut) {}

    fn read_from(_buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Empty)
    }
}

// ---------------------------------------------------------------------------
// Node metadata
// ---------------------------------------------------------------------------

/// Node metadata returned with reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub version: i32,
    pub cversion: i32,
    pub aversion: i32,
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    pub pzxid: i64,
}

impl Record for Stat {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i64(self.czxid);
        buf.put_i64(self.mzxid);
        buf.put_i64(self.ctime);
        buf.put_i64(self.mtime);
        buf.put_i32(self.version);
        buf.put_i32(self.cversion);
        buf.put_i32(self.aversion);
        buf.put_i64(self.ephemeral_owner);
        buf.put_i32(self.data_length);
        buf.put_i32(self.num_children);
        buf.put_i64(self.pzxid);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            czxid: get_i64(buf)?,
            mzxid: get_i64(buf)?,
            ctime: get_i64(buf)?,
            mtime: get_i64(buf)?,
            version: get_i32(buf)?,
            cversion: get_i32(buf)?,
            aversion: get_i32(buf)?,
            ephemeral_owner: get_i64(buf)?,
            data_length: get_i32(buf)?,
            num_children: get_i32(buf)?,
            pzxid: get_i64(buf)?,
        })
    }
}

pub mod perms {
    pub const READ: i32 = 1;
    pub const WRITE: i32 = 2;
    pub const CREATE: i32 = 4;
    pub const DELETE: i32 = 8;
    pub const ADMIN: i32 = 16;
    pub const ALL: i32 = READ | WRITE | CREATE | DELETE | ADMIN;
}

/// One access control entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    pub perms: i32,
    pub scheme: String,
    pub id: String,
}

impl Acl {
    /// Everyone may do everything (`world:anyone`, all permissions).
    pub fn open_unsafe() -> Vec<Acl> {
        vec![Acl {
            perms: perms::ALL,
            scheme: "world".into(),
            id: "anyone".into(),
        }]
    }
}

impl Record for Acl {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32(self.perms);
        put_string(buf, &self.scheme);
        put_string(buf, &self.id);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            perms: get_i32(buf)?,
            scheme: get_string(buf)?,
            id: get_string(buf)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub acl: Vec<Acl>,
    pub flags: i32,
}

impl Record for CreateRequest {
    fn write_to(&self, buf: &mut BytesMut) {
        put_string(buf, &self.path);
        put_buffer(buf, &self.data);
        buf.put_i32(self.acl.len() as i32);
        for entry in &self.acl {
            entry.write_to(buf);
        }
        buf.put_i32(self.flags);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            path: get_string(buf)?,
            data: get_buffer(buf)?,
            acl: get_vec(buf, Acl::read_from)?,
            flags: get_i32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResponse {
    pub path: String,
}

impl Record for CreateResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        put_string(buf, &self.path);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            path: get_string(buf)?,
        })
    }
}

/// Shared by getData and getChildren.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathWatchRequest {
    pub path: String,
    pub watch: bool,
}

impl Record for PathWatchRequest {
    fn write_to(&self, buf: &mut BytesMut) {
        put_string(buf, &self.path);
        put_bool(buf, self.watch);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            path: get_string(buf)?,
            watch: get_bool(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDataResponse {
    pub data: Vec<u8>,
    pub stat: Stat,
}

impl Record for GetDataResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        put_buffer(buf, &self.data);
        self.stat.write_to(buf);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            data: get_buffer(buf)?,
            stat: Stat::read_from(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDataRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub version: i32,
}

impl Record for SetDataRequest {
    fn write_to(&self, buf: &mut BytesMut) {
        put_string(buf, &self.path);
        put_buffer(buf, &self.data);
        buf.put_i32(self.version);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            path: get_string(buf)?,
            data: get_buffer(buf)?,
            version: get_i32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDataResponse {
    pub stat: Stat,
}

impl Record for SetDataResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        self.stat.write_to(buf);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            stat: Stat::read_from(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChildrenResponse {
    pub children: Vec<String>,
}

impl Record for GetChildrenResponse {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32(self.children.len() as i32);
        for child in &self.children {
            put_string(buf, child);
        }
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            children: get_vec(buf, get_string)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPacket {
    pub auth_type: i32,
    pub scheme: String,
    pub auth: Vec<u8>,
}

impl Record for AuthPacket {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32(self.auth_type);
        put_string(buf, &self.scheme);
        put_buffer(buf, &self.auth);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            auth_type: get_i32(buf)?,
            scheme: get_string(buf)?,
            auth: get_buffer(buf)?,
        })
    }
}

/// Body of a notification frame (xid -1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub event_type: i32,
    pub state: i32,
    pub path: String,
}

impl Record for WatcherEvent {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32(self.event_type);
        buf.put_i32(self.state);
        put_string(buf, &self.path);
    }

    fn read_from(buf: &mut Bytes) -> Result<Self, ZkError> {
        Ok(Self {
            event_type: get_i32(buf)?,
            state: get_i32(buf)?,
            path: get_string(buf)?,
        })
    }
}

/// Check that a successful reply body parses as the response `op` expects.
pub fn check_reply_body(op: OpCode, body: &Bytes) -> Result<(), ZkError> {
    let mut body = body.clone();
    match op {
        OpCode::Create => CreateResponse::read_from(&mut body).map(drop),
        OpCode::GetData => GetDataResponse::read_from(&mut body).map(drop),
        OpCode::SetData => SetDataResponse::read_from(&mut body).map(drop),
        OpCode::GetChildren => GetChildrenResponse::read_from(&mut body).map(drop),
        OpCode::Ping | OpCode::CloseSession | OpCode::Auth => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_layout() {
        let request = ConnectRequest {
            protocol_version: 0,
            last_zxid_seen: 7,
            timeout_ms: 10_000,
            session_id: 0x1234,
            password: vec![0xAB; 16],
        };
        let bytes = encode(&request);
        // 4 + 8 + 4 + 8 + (4 + 16)
        assert_eq!(bytes.len(), 44);
        assert_eq!(&bytes[12..16], &10_000i32.to_be_bytes());
        assert_eq!(decode::<ConnectRequest>(bytes).unwrap(), request);
    }

    #[test]
    fn test_connect_response_ignores_trailing_read_only_flag() {
        let mut buf = BytesMut::new();
        ConnectResponse {
            protocol_version: 0,
            timeout_ms: 4000,
            session_id: 99,
            password: vec![1, 2, 3],
        }
        .write_to(&mut buf);
        buf.put_u8(0);
        let response: ConnectResponse = decode(buf.freeze()).unwrap();
        assert_eq!(response.session_id, 99);
        assert!(!response.is_refused());
        assert!(ConnectResponse::refused().is_refused());
    }

    #[test]
    fn test_truncated_frame_is_protocol_error() {
        let bytes = Bytes::from_static(&[0, 0, 0, 1, 0, 0]);
        let err = decode::<ReplyHeader>(bytes).unwrap_err();
        assert!(matches!(err, ZkError::Protocol { code: None, .. }));
    }

    #[test]
    fn test_null_buffer_reads_as_empty() {
        let mut buf = BytesMut::new();
        buf.put_i32(-1);
        let mut bytes = buf.freeze();
        assert!(get_buffer(&mut bytes).unwrap().is_empty());
    }

    #[test]
    fn test_reply_body_checked_against_operation() {
        let created = encode(&CreateResponse { path: "/a".into() });
        assert!(check_reply_body(OpCode::Create, &created).is_ok());
        assert!(check_reply_body(OpCode::GetData, &Bytes::new()).is_err());
        assert!(check_reply_body(OpCode::CloseSession, &Bytes::new()).is_ok());
    }

    #[test]
    fn test_oversized_vector_count_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32(1_000_000);
        assert!(decode::<GetChildrenResponse>(buf.freeze()).is_err());
    }

    #[test]
    fn test_create_request_with_open_acl() {
        let request = CreateRequest {
            path: "/app/lock-".into(),
            data: b"owner".to_vec(),
            acl: Acl::open_unsafe(),
            flags: 3,
        };
        let decoded: CreateRequest = decode(encode(&request)).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.acl[0].perms, 31);
    }

    #[test]
    fn test_header_then_body() {
        let frame = encode_with_header(
            &RequestHeader {
                xid: 5,
                op: OpCode::GetChildren.code(),
            },
            &PathWatchRequest {
                path: "/a".into(),
                watch: false,
            },
        );
        let mut bytes = frame;
        let header = RequestHeader::read_from(&mut bytes).unwrap();
        assert_eq!(header.xid, 5);
        assert_eq!(OpCode::from_code(header.op), Some(OpCode::GetChildren));
        let body = PathWatchRequest::read_from(&mut bytes).unwrap();
        assert_eq!(body.path, "/a");
        assert!(!bytes.has_remaining());
    }
}
