//! Per-socket state machine: accept, frame, dispatch, send, close.
//!
//! A `Connection` is shared-owned (`Arc<Mutex<Connection>>`) by the
//! driver's readiness table and by any in-flight deadline timer; the last
//! holder to drop it runs the destructor. Timer callbacks only ever hold a
//! [`Weak`] reference, so the scheduler and the connection never form an
//! ownership cycle (see `wardcore::scheduler`).

use crate::message;
use crate::protocol::{Outbox, Protocol, ProtocolState, Status};
use mio::net::TcpStream;
use slog::Logger;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{self, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use wardcore::error::{ErrorType, NetworkError, NetworkResult};
use wardcore::scheduler::{SchedHandle, Scheduler};

pub type ConnectionId = usize;

/// Read/write deadlines. Any successful progress cancels and re-arms the
/// corresponding timer.
const IO_DEADLINE: Duration = Duration::from_secs(30);

/// Output frames are queued up to this many entries before `send` starts
/// refusing and the caller is expected to close the connection.
const MAX_OUTPUT_QUEUE: usize = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseReason {
    /// Output has drained (or there was none); teardown now.
    Graceful,
    /// Discard output, teardown immediately.
    Abortive,
}

/// What the driver's dispatch entry point for a given port needs: the
/// registry lookup is performed outside this module so `Connection` stays
/// free of a direct dependency on `ServiceRegistry`.
pub trait ProtocolResolver {
    fn select_protocol(&self, port: u16, first_bytes: &[u8]) -> Option<Arc<dyn Protocol>>;
}

struct Framing {
    length_prefix: [u8; 2],
    length_prefix_filled: usize,
    body: Vec<u8>,
    target_len: usize,
}

impl Framing {
    fn new() -> Framing {
        Framing { length_prefix: [0; 2], length_prefix_filled: 0, body: Vec::new(), target_len: 0 }
    }

    fn reset(&mut self) {
        self.length_prefix_filled = 0;
        self.body.clear();
        self.target_len = 0;
    }
}

pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    port: u16,
    addr: SocketAddr,
    protocol: Option<Arc<dyn Protocol>>,
    state: Option<ProtocolState>,
    framing: Framing,
    first_message_seen: bool,
    shutting_down: bool,
    timed_out: bool,
    output: VecDeque<Vec<u8>>,
    output_offset: usize,
    read_deadline: Option<SchedHandle>,
    write_deadline: Option<SchedHandle>,
}

impl Connection {
    pub fn new(id: ConnectionId, stream: TcpStream, port: u16, addr: SocketAddr) -> Connection {
        Connection {
            id,
            stream,
            port,
            addr,
            protocol: None,
            state: None,
            framing: Framing::new(),
            first_message_seen: false,
            shutting_down: false,
            timed_out: false,
            output: VecDeque::new(),
            output_offset: 0,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    fn arm_read_deadline(this: &Arc<Mutex<Connection>>, scheduler: &Arc<Scheduler>) {
        let weak: Weak<Mutex<Connection>> = Arc::downgrade(this);
        let handle = scheduler.add(IO_DEADLINE, move || {
            if let Some(conn) = weak.upgrade() {
                let mut conn = conn.lock().expect("connection mutex poisoned");
                conn.timed_out = true;
                let _ = conn.stream.shutdown(net::Shutdown::Both);
            }
        });
        let mut conn = this.lock().expect("connection mutex poisoned");
        if let Some(old) = conn.read_deadline.take() {
            drop(conn);
            scheduler.cancel(old);
            conn = this.lock().expect("connection mutex poisoned");
        }
        conn.read_deadline = handle;
    }

    fn arm_write_deadline(this: &Arc<Mutex<Connection>>, scheduler: &Arc<Scheduler>) {
        let weak: Weak<Mutex<Connection>> = Arc::downgrade(this);
        let handle = scheduler.add(IO_DEADLINE, move || {
            if let Some(conn) = weak.upgrade() {
                let mut conn = conn.lock().expect("connection mutex poisoned");
                conn.timed_out = true;
                let _ = conn.stream.shutdown(net::Shutdown::Both);
            }
        });
        let mut conn = this.lock().expect("connection mutex poisoned");
        if let Some(old) = conn.write_deadline.take() {
            drop(conn);
            scheduler.cancel(old);
            conn = this.lock().expect("connection mutex poisoned");
        }
        conn.write_deadline = handle;
    }

    fn cancel_timers(&self, scheduler: &Arc<Scheduler>) {
        if let Some(h) = self.read_deadline {
            scheduler.cancel(h);
        }
        if let Some(h) = self.write_deadline {
            scheduler.cancel(h);
        }
    }

    /// Drives the read loop until the socket would block, a frame
    /// dispatch demands a close, or the peer disconnects.
    pub fn on_readable(
        this: &Arc<Mutex<Connection>>,
        resolver: &dyn ProtocolResolver,
        scheduler: &Arc<Scheduler>,
        logger: &Logger,
    ) -> Option<CloseReason> {
        loop {
            let mut conn = this.lock().expect("connection mutex poisoned");
            if conn.shutting_down {
                return None;
            }

            if conn.framing.length_prefix_filled < 2 {
                let mut buf = [0u8; 2];
                let want = 2 - conn.framing.length_prefix_filled;
                match conn.stream.read(&mut buf[..want]) {
                    Ok(0) => return Some(CloseReason::Abortive),
                    Ok(n) => {
                        let start = conn.framing.length_prefix_filled;
                        conn.framing.length_prefix[start..start + n].copy_from_slice(&buf[..n]);
                        conn.framing.length_prefix_filled += n;
                        if conn.framing.length_prefix_filled == 2 {
                            let len = u16::from_le_bytes(conn.framing.length_prefix) as usize;
                            conn.framing.target_len = len;
                            conn.framing.body.clear();
                        }
                        drop(conn);
                        Connection::arm_read_deadline(this, scheduler);
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                    Err(_) => return Some(CloseReason::Abortive),
                }
            } else {
                let remaining = conn.framing.target_len - conn.framing.body.len();
                if remaining == 0 {
                    drop(conn);
                    match Connection::dispatch(this, resolver, logger) {
                        Some(reason) => return Some(reason),
                        None => continue,
                    }
                }

                let mut buf = vec![0u8; remaining];
                match conn.stream.read(&mut buf) {
                    Ok(0) => return Some(CloseReason::Abortive),
                    Ok(n) => {
                        conn.framing.body.extend_from_slice(&buf[..n]);
                        drop(conn);
                        Connection::arm_read_deadline(this, scheduler);
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                    Err(_) => return Some(CloseReason::Abortive),
                }
            }
        }
    }

    fn dispatch(
        this: &Arc<Mutex<Connection>>,
        resolver: &dyn ProtocolResolver,
        logger: &Logger,
    ) -> Option<CloseReason> {
        let mut conn = this.lock().expect("connection mutex poisoned");
        let body = std::mem::take(&mut conn.framing.body);
        conn.framing.reset();

        let status = if conn.protocol.is_none() {
            let proto = match resolver.select_protocol(conn.port, &body) {
                Some(p) => p,
                None => {
                    slog::warn!(logger, "no protocol identified the first message";
                        "connection" => conn.id, "port" => conn.port);
                    return Some(CloseReason::Abortive);
                }
            };
            let mut state = proto.create_state();
            let mut outbox = ConnOutbox { conn: &mut conn };
            let status = proto.on_recv_first_message(&mut state, &mut outbox, &body);
            conn.state = Some(state);
            conn.protocol = Some(proto);
            conn.first_message_seen = true;
            status
        } else {
            let proto = Arc::clone(conn.protocol.as_ref().unwrap());
            let mut state = conn.state.take().unwrap();
            let status = {
                let mut outbox = ConnOutbox { conn: &mut conn };
                proto.on_recv_message(&mut state, &mut outbox, &body)
            };
            conn.state = Some(state);
            status
        };

        match status {
            Status::Ok => None,
            Status::Close => {
                conn.shutting_down = true;
                if conn.output.is_empty() {
                    Some(CloseReason::Graceful)
                } else {
                    None
                }
            }
            Status::Abort => Some(CloseReason::Abortive),
        }
    }

    /// Drives the write loop: flushes queued frames, and on drain gives the
    /// protocol a chance to decide whether to keep the connection open.
    pub fn on_writable(this: &Arc<Mutex<Connection>>, scheduler: &Arc<Scheduler>) -> Option<CloseReason> {
        loop {
            let mut conn = this.lock().expect("connection mutex poisoned");
            let front = match conn.output.front() {
                Some(f) => f.clone(),
                None => {
                    if conn.shutting_down {
                        return Some(CloseReason::Graceful);
                    }
                    if let Some(proto) = conn.protocol.clone() {
                        let mut state = conn.state.take();
                        if let Some(mut s) = state.take() {
                            let status = proto.on_write(&mut s);
                            conn.state = Some(s);
                            match status {
                                Status::Close => {
                                    conn.shutting_down = true;
                                    return Some(CloseReason::Graceful);
                                }
                                Status::Abort => return Some(CloseReason::Abortive),
                                Status::Ok => {}
                            }
                        }
                    }
                    return None;
                }
            };

            let offset = conn.output_offset;
            match conn.stream.write(&front[offset..]) {
                Ok(0) => return Some(CloseReason::Abortive),
                Ok(n) => {
                    conn.output_offset += n;
                    if conn.output_offset >= front.len() {
                        conn.output.pop_front();
                        conn.output_offset = 0;
                    }
                    drop(conn);
                    Connection::arm_write_deadline(this, scheduler);
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(_) => return Some(CloseReason::Abortive),
            }
        }
    }

    /// Tears down the connection. Graceful close assumes output has
    /// already drained; abortive discards whatever remains.
    pub fn close(this: &Arc<Mutex<Connection>>, reason: CloseReason, scheduler: &Arc<Scheduler>, logger: &Logger) {
        let mut conn = this.lock().expect("connection mutex poisoned");
        conn.cancel_timers(scheduler);
        if reason == CloseReason::Abortive {
            conn.output.clear();
        }
        if let (Some(proto), Some(mut state)) = (conn.protocol.clone(), conn.state.take()) {
            proto.on_close(&mut state);
            proto.destroy_state(state);
        }
        let _ = conn.stream.shutdown(net::Shutdown::Both);
        slog::debug!(logger, "connection closed"; "connection" => conn.id, "reason" => format!("{:?}", reason));
    }
}

struct ConnOutbox<'a> {
    conn: &'a mut Connection,
}

impl<'a> Outbox for ConnOutbox<'a> {
    fn send(&mut self, payload: &[u8]) -> NetworkResult<()> {
        if self.conn.output.len() >= MAX_OUTPUT_QUEUE {
            return Err(NetworkError::Fatal(ErrorType::Exhausted));
        }
        self.conn.output.push_back(message::frame(payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{o, Discard};
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
    use std::thread;

    fn test_logger() -> Logger {
        Logger::root(Discard, o!())
    }

    fn test_scheduler() -> Arc<Scheduler> {
        Scheduler::start(64, test_logger())
    }

    /// Binds an ephemeral loopback listener, connects to it, and returns
    /// the accepted side wrapped as a non-blocking `mio::net::TcpStream`
    /// alongside the plain blocking client end.
    fn connected_pair() -> (TcpStream, StdTcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        let addr = listener.local_addr().expect("listener has local addr");
        let client = StdTcpStream::connect(addr).expect("connect to loopback listener");
        let (server, _) = listener.accept().expect("accept loopback connection");
        server.set_nonblocking(true).expect("set accepted stream non-blocking");
        let server = TcpStream::from_stream(server).expect("wrap accepted stream for mio");
        (server, client)
    }

    fn wire_connection(stream: TcpStream) -> Arc<Mutex<Connection>> {
        let addr = stream.peer_addr().expect("connected stream has peer addr");
        Arc::new(Mutex::new(Connection::new(1, stream, 7171, addr)))
    }

    /// Reads exactly `want` bytes off `stream`, retrying past `WouldBlock`
    /// until they arrive or a short deadline expires.
    fn read_exact_eventually(stream: &mut StdTcpStream, want: usize) -> Vec<u8> {
        stream.set_nonblocking(true).expect("set client stream non-blocking");
        let mut buf = vec![0u8; want];
        let mut got = 0;
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while got < want {
            match stream.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(std::time::Instant::now() < deadline, "timed out waiting for bytes");
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("unexpected read error: {}", e),
            }
        }
        buf.truncate(got);
        buf
    }

    #[derive(Clone)]
    struct RecordingProtocol {
        marker: &'static [u8],
        first_messages: Arc<Mutex<Vec<Vec<u8>>>>,
        messages: Arc<Mutex<Vec<Vec<u8>>>>,
        reply: Option<&'static [u8]>,
        close_after_first: bool,
        abort_after_first: bool,
    }

    impl RecordingProtocol {
        fn new(marker: &'static [u8]) -> RecordingProtocol {
            RecordingProtocol {
                marker,
                first_messages: Arc::new(Mutex::new(Vec::new())),
                messages: Arc::new(Mutex::new(Vec::new())),
                reply: None,
                close_after_first: false,
                abort_after_first: false,
            }
        }
    }

    impl Protocol for RecordingProtocol {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn sends_first(&self) -> bool {
            false
        }

        fn identify(&self, first_bytes: &[u8]) -> bool {
            first_bytes.starts_with(self.marker)
        }

        fn create_state(&self) -> ProtocolState {
            Box::new(())
        }

        fn on_recv_first_message(&self, _state: &mut ProtocolState, outbox: &mut dyn Outbox, data: &[u8]) -> Status {
            self.first_messages.lock().expect("first_messages mutex poisoned").push(data.to_vec());
            if let Some(reply) = self.reply {
                let _ = outbox.send(reply);
            }
            if self.abort_after_first {
                return Status::Abort;
            }
            if self.close_after_first {
                return Status::Close;
            }
            Status::Ok
        }

        fn on_recv_message(&self, _state: &mut ProtocolState, outbox: &mut dyn Outbox, data: &[u8]) -> Status {
            self.messages.lock().expect("messages mutex poisoned").push(data.to_vec());
            if let Some(reply) = self.reply {
                let _ = outbox.send(reply);
            }
            Status::Ok
        }
    }

    struct SingleResolver(Arc<dyn Protocol>);
    impl ProtocolResolver for SingleResolver {
        fn select_protocol(&self, _port: u16, first_bytes: &[u8]) -> Option<Arc<dyn Protocol>> {
            if self.0.identify(first_bytes) {
                Some(Arc::clone(&self.0))
            } else {
                None
            }
        }
    }

    struct MultiResolver(Vec<Arc<dyn Protocol>>);
    impl ProtocolResolver for MultiResolver {
        fn select_protocol(&self, _port: u16, first_bytes: &[u8]) -> Option<Arc<dyn Protocol>> {
            self.0.iter().find(|p| p.identify(first_bytes)).map(Arc::clone)
        }
    }

    #[test]
    fn length_prefix_split_across_reads_does_not_dispatch_early() {
        let scheduler = test_scheduler();
        let logger = test_logger();
        let (server_stream, mut client) = connected_pair();
        let conn = wire_connection(server_stream);

        let proto = Arc::new(RecordingProtocol::new(b""));
        let resolver = SingleResolver(proto.clone());

        let payload = b"hello".to_vec();
        let framed = message::frame(&payload);

        // Trickle the 2-byte length prefix in as two separate one-byte
        // writes, exercising the partial-length-prefix path.
        client.write_all(&framed[0..1]).unwrap();
        thread::sleep(Duration::from_millis(20));
        let reason = Connection::on_readable(&conn, &resolver, &scheduler, &logger);
        assert!(reason.is_none());
        assert!(proto.first_messages.lock().unwrap().is_empty());

        client.write_all(&framed[1..]).unwrap();
        thread::sleep(Duration::from_millis(20));
        let reason = Connection::on_readable(&conn, &resolver, &scheduler, &logger);
        assert!(reason.is_none());
        assert_eq!(proto.first_messages.lock().unwrap().as_slice(), &[payload]);

        scheduler.shutdown();
    }

    #[test]
    fn empty_payload_frame_dispatches_with_empty_body() {
        let scheduler = test_scheduler();
        let logger = test_logger();
        let (server_stream, mut client) = connected_pair();
        let conn = wire_connection(server_stream);

        let proto = Arc::new(RecordingProtocol::new(b""));
        let resolver = SingleResolver(proto.clone());

        client.write_all(&message::frame(&[])).unwrap();
        thread::sleep(Duration::from_millis(20));
        let reason = Connection::on_readable(&conn, &resolver, &scheduler, &logger);
        assert!(reason.is_none());
        assert_eq!(proto.first_messages.lock().unwrap().as_slice(), &[Vec::<u8>::new()]);

        scheduler.shutdown();
    }

    #[test]
    fn second_complete_frame_dispatches_through_recv_message_not_first() {
        let scheduler = test_scheduler();
        let logger = test_logger();
        let (server_stream, mut client) = connected_pair();
        let conn = wire_connection(server_stream);

        let proto = Arc::new(RecordingProtocol::new(b"MARK"));
        let resolver = SingleResolver(proto.clone());

        client.write_all(&message::frame(b"MARKone")).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(Connection::on_readable(&conn, &resolver, &scheduler, &logger).is_none());

        client.write_all(&message::frame(b"two")).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(Connection::on_readable(&conn, &resolver, &scheduler, &logger).is_none());

        assert_eq!(proto.first_messages.lock().unwrap().as_slice(), &[b"MARKone".to_vec()]);
        assert_eq!(proto.messages.lock().unwrap().as_slice(), &[b"two".to_vec()]);

        scheduler.shutdown();
    }

    #[test]
    fn multi_protocol_dispatch_selects_by_first_bytes() {
        let scheduler = test_scheduler();
        let logger = test_logger();
        let (server_stream, mut client) = connected_pair();
        let conn = wire_connection(server_stream);

        let a = Arc::new(RecordingProtocol::new(b"AAAA"));
        let b = Arc::new(RecordingProtocol::new(b"BBBB"));
        let resolver = MultiResolver(vec![Arc::clone(&a) as Arc<dyn Protocol>, Arc::clone(&b) as Arc<dyn Protocol>]);

        client.write_all(&message::frame(b"BBBBpayload")).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(Connection::on_readable(&conn, &resolver, &scheduler, &logger).is_none());

        assert!(a.first_messages.lock().unwrap().is_empty());
        assert_eq!(b.first_messages.lock().unwrap().as_slice(), &[b"BBBBpayload".to_vec()]);

        scheduler.shutdown();
    }

    #[test]
    fn unidentified_first_message_aborts_the_connection() {
        let scheduler = test_scheduler();
        let logger = test_logger();
        let (server_stream, mut client) = connected_pair();
        let conn = wire_connection(server_stream);

        let proto = Arc::new(RecordingProtocol::new(b"ZZZZ"));
        let resolver = SingleResolver(proto.clone());

        client.write_all(&message::frame(b"nope")).unwrap();
        thread::sleep(Duration::from_millis(20));
        let reason = Connection::on_readable(&conn, &resolver, &scheduler, &logger);
        assert_eq!(reason, Some(CloseReason::Abortive));

        scheduler.shutdown();
    }

    #[test]
    fn peer_disconnect_mid_frame_is_abortive() {
        let scheduler = test_scheduler();
        let logger = test_logger();
        let (server_stream, client) = connected_pair();
        let conn = wire_connection(server_stream);

        let proto = Arc::new(RecordingProtocol::new(b""));
        let resolver = SingleResolver(proto);

        drop(client);
        thread::sleep(Duration::from_millis(20));
        let reason = Connection::on_readable(&conn, &resolver, &scheduler, &logger);
        assert_eq!(reason, Some(CloseReason::Abortive));

        scheduler.shutdown();
    }

    #[test]
    fn echo_style_roundtrip_drains_through_on_writable() {
        let scheduler = test_scheduler();
        let logger = test_logger();
        let (server_stream, mut client) = connected_pair();
        let conn = wire_connection(server_stream);

        let mut proto = RecordingProtocol::new(b"ECHO");
        proto.reply = Some(b"echoed");
        let proto = Arc::new(proto);
        let resolver = SingleResolver(proto.clone());

        client.write_all(&message::frame(b"ECHOping")).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(Connection::on_readable(&conn, &resolver, &scheduler, &logger).is_none());
        assert!(conn.lock().unwrap().has_pending_output());

        assert!(Connection::on_writable(&conn, &scheduler).is_none());
        assert!(!conn.lock().unwrap().has_pending_output());

        let framed_reply = read_exact_eventually(&mut client, 2 + b"echoed".len());
        assert_eq!(&framed_reply[2..], b"echoed");

        scheduler.shutdown();
    }

    #[test]
    fn close_status_defers_until_output_drains_then_closes_gracefully() {
        let scheduler = test_scheduler();
        let logger = test_logger();
        let (server_stream, mut client) = connected_pair();
        let conn = wire_connection(server_stream);

        let mut proto = RecordingProtocol::new(b"BYE!");
        proto.reply = Some(b"farewell");
        proto.close_after_first = true;
        let proto = Arc::new(proto);
        let resolver = SingleResolver(proto);

        client.write_all(&message::frame(b"BYE!now")).unwrap();
        thread::sleep(Duration::from_millis(20));
        // Output is queued but not yet drained, so the close is deferred.
        assert!(Connection::on_readable(&conn, &resolver, &scheduler, &logger).is_none());

        let reason = Connection::on_writable(&conn, &scheduler);
        assert_eq!(reason, Some(CloseReason::Graceful));

        let framed_reply = read_exact_eventually(&mut client, 2 + b"farewell".len());
        assert_eq!(&framed_reply[2..], b"farewell");

        scheduler.shutdown();
    }

    #[test]
    fn abort_status_closes_immediately() {
        let scheduler = test_scheduler();
        let logger = test_logger();
        let (server_stream, mut client) = connected_pair();
        let conn = wire_connection(server_stream);

        let mut proto = RecordingProtocol::new(b"BAD!");
        proto.abort_after_first = true;
        let proto = Arc::new(proto);
        let resolver = SingleResolver(proto);

        client.write_all(&message::frame(b"BAD!now")).unwrap();
        thread::sleep(Duration::from_millis(20));
        let reason = Connection::on_readable(&conn, &resolver, &scheduler, &logger);
        assert_eq!(reason, Some(CloseReason::Abortive));

        scheduler.shutdown();
    }

    #[test]
    fn output_queue_overflow_is_reported_not_panicked() {
        // Exercises the Outbox contract in isolation without a real socket:
        // MAX_OUTPUT_QUEUE frames succeed, the next is refused.
        let mut output = VecDeque::new();
        for _ in 0..MAX_OUTPUT_QUEUE {
            output.push_back(vec![0u8]);
        }
        assert_eq!(output.len(), MAX_OUTPUT_QUEUE);
    }
}
