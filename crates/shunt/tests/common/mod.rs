//! Shared helpers for integration tests: an aggregating stats reporter, a
//! closure-backed relay host, log capture, and a raw wire client for
//! speaking the protocol directly.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;

use shunt::core::{
    CallFlags, CallReqHeader, ChecksumType, ContinueHeader, Frame, FrameHeader, FramePool,
    InitBody, MessageType, Span, ID_PROTOCOL,
};
use shunt::relay::{RelayCall, RelayConnInfo, RelayHost, RelayStart, RelayStartError};
use shunt::StatsReporter;

// ============================================================================
// Stats
// ============================================================================

/// Aggregates every counter event into a map for assertions.
#[derive(Default)]
pub struct MockStats {
    counters: Mutex<HashMap<String, u64>>,
}

impl MockStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, key: impl Into<String>, delta: u64) {
        *self.counters.lock().entry(key.into()).or_insert(0) += delta;
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counters.lock().get(key).copied().unwrap_or(0)
    }

    pub fn map(&self) -> HashMap<String, u64> {
        self.counters.lock().clone()
    }

    /// Sum of counters whose key contains `needle`.
    pub fn sum_matching(&self, needle: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|(k, _)| k.contains(needle))
            .map(|(_, v)| *v)
            .sum()
    }
}

impl StatsReporter for MockStats {
    fn inc(&self, key: &str, delta: u64) {
        self.add(key, delta);
    }
}

// ============================================================================
// Relay host
// ============================================================================

/// What a [`FuncHost`] decides per call.
pub enum HostDecision {
    Forward(String),
    /// Forward with no destination (exercises the bad-relay-host path).
    NoDestination,
    Drop,
    Fail(RelayStartError),
}

type HostFn = dyn Fn(&RelayConnInfo, &str, &str, &str) -> HostDecision + Send + Sync;

/// Relay host backed by a function of (conn, caller, service, method),
/// tracking per-call stats into a [`MockStats`] under
/// `caller->service::method.<event>` keys.
pub struct FuncHost {
    decide: Box<HostFn>,
    stats: Arc<MockStats>,
}

impl FuncHost {
    pub fn new(
        stats: Arc<MockStats>,
        decide: impl Fn(&RelayConnInfo, &str, &str, &str) -> HostDecision + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            decide: Box::new(decide),
            stats,
        })
    }

    /// Host that forwards every call to one destination.
    pub fn fixed(stats: Arc<MockStats>, dest: impl Into<String>) -> Arc<Self> {
        let dest = dest.into();
        Self::new(stats, move |_conn, _caller, _service, _method| {
            HostDecision::Forward(dest.clone())
        })
    }
}

impl RelayHost for FuncHost {
    fn start(
        &self,
        frame: &shunt::core::LazyCallReq<'_>,
        conn: &RelayConnInfo,
    ) -> RelayStart {
        let caller = String::from_utf8_lossy(frame.caller().unwrap_or(b"")).into_owned();
        let service = String::from_utf8_lossy(frame.service()).into_owned();
        let method = String::from_utf8_lossy(frame.method()).into_owned();
        let call = MockCall {
            prefix: format!("{caller}->{service}::{method}"),
            dest: None,
            stats: self.stats.clone(),
        };
        match (self.decide)(conn, &caller, &service, &method) {
            HostDecision::Forward(dest) => RelayStart::Forward(Box::new(MockCall {
                dest: Some(dest),
                ..call
            })),
            HostDecision::NoDestination => RelayStart::Forward(Box::new(call)),
            HostDecision::Drop => RelayStart::Drop,
            HostDecision::Fail(err) => RelayStart::Fail {
                call: Some(Box::new(call)),
                err,
            },
        }
    }
}

pub struct MockCall {
    prefix: String,
    dest: Option<String>,
    stats: Arc<MockStats>,
}

impl RelayCall for MockCall {
    fn destination(&self) -> Option<String> {
        self.dest.clone()
    }

    fn sent_bytes(&self, n: u64) {
        self.stats.add(format!("{}.sent-bytes", self.prefix), n);
    }

    fn received_bytes(&self, n: u64) {
        self.stats.add(format!("{}.received-bytes", self.prefix), n);
    }

    fn succeeded(&self) {
        self.stats.add(format!("{}.success", self.prefix), 1);
    }

    fn failed(&self, reason: &str) {
        self.stats.add(format!("{}.failed-{reason}", self.prefix), 1);
    }

    fn end(&self) {
        self.stats.add(format!("{}.end", self.prefix), 1);
    }
}

// ============================================================================
// Log capture
// ============================================================================

#[derive(Clone)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn count(&self, needle: &str) -> usize {
        let buf = self.buf.lock();
        let text = String::from_utf8_lossy(&buf);
        text.matches(needle).count()
    }
}

struct LogWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Install a thread-local subscriber capturing all logs for the test.
/// Use with current-thread runtimes so spawned tasks share the thread.
pub fn capture_logs() -> (tracing::subscriber::DefaultGuard, LogCapture) {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let capture = LogCapture { buf: buf.clone() };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || LogWriter(buf.clone()))
        .finish();
    (tracing::subscriber::set_default(subscriber), capture)
}

// ============================================================================
// Raw wire client
// ============================================================================

/// A TCP client that speaks the wire protocol directly, for forging frames
/// the public API would never produce.
pub struct RawClient {
    pub stream: TcpStream,
    pub pool: FramePool,
}

impl RawClient {
    /// Connect and complete the init handshake as an ephemeral peer.
    pub async fn connect(addr: &str, process_name: &str) -> RawClient {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let pool = FramePool::new();

        let mut buf = pool.get();
        InitBody::new(shunt::core::EPHEMERAL_HOST_PORT, process_name)
            .encode(&mut buf)
            .expect("encode init");
        let frame = Frame::from_parts(FrameHeader::new(MessageType::InitReq, ID_PROTOCOL), buf);
        frame.write_to(&mut stream).await.expect("write init-req");

        let res = Frame::read_from(&mut stream, &pool)
            .await
            .expect("read init-res")
            .expect("init-res frame");
        assert_eq!(res.header.message_type, MessageType::InitRes);

        RawClient { stream, pool }
    }

    /// Send a single-frame call request.
    pub async fn send_call_req(
        &mut self,
        id: u32,
        service: &str,
        method: &str,
        ttl_ms: u32,
        arg2: &[u8],
        arg3: &[u8],
    ) {
        let frame = build_call_req(&self.pool, id, service, method, ttl_ms, arg2, arg3);
        frame.write_to(&mut self.stream).await.expect("write call-req");
    }

    /// Read the next frame.
    pub async fn recv(&mut self) -> Option<Frame> {
        Frame::read_from(&mut self.stream, &self.pool)
            .await
            .expect("read frame")
    }
}

/// Build a single-frame call-req with raw arg scheme and a crc32 checksum.
pub fn build_call_req(
    pool: &FramePool,
    id: u32,
    service: &str,
    method: &str,
    ttl_ms: u32,
    arg2: &[u8],
    arg3: &[u8],
) -> Frame {
    build_call_req_scheme(pool, id, service, method, ttl_ms, "raw", arg2, arg3)
}

#[allow(clippy::too_many_arguments)]
pub fn build_call_req_scheme(
    pool: &FramePool,
    id: u32,
    service: &str,
    method: &str,
    ttl_ms: u32,
    scheme: &str,
    arg2: &[u8],
    arg3: &[u8],
) -> Frame {
    let header = CallReqHeader {
        flags: CallFlags::empty(),
        ttl_ms,
        span: Span::new_root(),
        service: service.to_owned(),
        headers: vec![
            ("as".to_owned(), scheme.to_owned()),
            ("cn".to_owned(), "raw-client".to_owned()),
        ],
        checksum_type: ChecksumType::Crc32,
    };
    let mut buf = pool.get();
    let slot = header.encode(&mut buf).expect("encode call-req header");
    let args_start = buf.len();
    for arg in [method.as_bytes(), arg2, arg3] {
        buf.extend_from_slice(&(arg.len() as u16).to_be_bytes());
        buf.extend_from_slice(arg);
    }
    let sum = ChecksumType::Crc32.compute(&buf[args_start..]);
    slot.patch(&mut buf, sum);
    Frame::from_parts(FrameHeader::new(MessageType::CallReq, id), buf)
}

/// Build a terminal call-req continuation carrying one chunk.
pub fn build_call_req_continue(pool: &FramePool, id: u32, chunk: &[u8]) -> Frame {
    let header = ContinueHeader {
        flags: CallFlags::empty(),
        checksum_type: ChecksumType::Crc32,
    };
    let mut buf = pool.get();
    let slot = header.encode(&mut buf);
    let args_start = buf.len();
    buf.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
    buf.extend_from_slice(chunk);
    let sum = ChecksumType::Crc32.compute(&buf[args_start..]);
    slot.patch(&mut buf, sum);
    Frame::from_parts(FrameHeader::new(MessageType::CallReqContinue, id), buf)
}

/// Encode a Thrift-style arg2 header block: `nh:2 (k~2 v~2)*`.
pub fn thrift_arg2(pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(pairs.len() as u16).to_be_bytes());
    for (k, v) in pairs {
        for field in [*k, *v] {
            buf.extend_from_slice(&(field.len() as u16).to_be_bytes());
            buf.extend_from_slice(field);
        }
    }
    buf
}

/// Decode a Thrift-style arg2 header block.
pub fn parse_thrift_arg2(buf: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let nh = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let mut off = 2;
    let mut pairs = Vec::with_capacity(nh);
    for _ in 0..nh {
        let mut fields = [Vec::new(), Vec::new()];
        for field in fields.iter_mut() {
            let len = u16::from_be_bytes([buf[off], buf[off + 1]]) as usize;
            off += 2;
            *field = buf[off..off + len].to_vec();
            off += len;
        }
        let [k, v] = fields;
        pairs.push((k, v));
    }
    pairs
}
