//! Server driver: the readiness loop that accepts connections and pumps
//! them through reads and writes. One accept poll per bound port, one
//! shared poll for all live connections, using the same edge-triggered,
//! zero-timeout poll shape throughout.

use crate::connection::{CloseReason, Connection, ConnectionId};
use crate::service::ServiceRegistry;
use mio::net::TcpListener;
use mio::{Events, Poll, PollOpt, Ready, Token};
use slog::Logger;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use wardcore::scheduler::Scheduler;

const ACCEPT_TOKEN_BASE: usize = 0;

/// A batch of readiness events with more than this fraction of handler
/// failures triggers a shutdown; between the warn and shutdown
/// thresholds just logs a warning.
const BATCH_WARN_RATIO: f64 = 0.5;
const BATCH_SHUTDOWN_RATIO: f64 = 0.9;

struct Listener {
    port: u16,
    socket: TcpListener,
}

pub struct Driver {
    accept_poll: Poll,
    live_poll: Poll,
    events: Events,
    listeners: Vec<Listener>,
    registry: Arc<ServiceRegistry>,
    scheduler: Arc<Scheduler>,
    logger: Logger,
    connections: HashMap<ConnectionId, Arc<Mutex<Connection>>>,
    next_id: ConnectionId,
    running: bool,
}

impl Driver {
    /// Binds a listener for every port the registry knows about and
    /// prepares the two polls (accept, live).
    pub fn new(registry: Arc<ServiceRegistry>, scheduler: Arc<Scheduler>, logger: Logger) -> io::Result<Driver> {
        let accept_poll = Poll::new()?;
        let live_poll = Poll::new()?;
        let mut listeners = Vec::new();

        for (i, &port) in registry.ports().enumerate() {
            let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().expect("valid bind address");
            let socket = TcpListener::bind(&addr)?;
            accept_poll.register(
                &socket,
                Token(ACCEPT_TOKEN_BASE + i),
                Ready::readable(),
                PollOpt::edge(),
            )?;
            listeners.push(Listener { port, socket });
        }

        Ok(Driver {
            accept_poll,
            live_poll,
            events: Events::with_capacity(4096),
            listeners,
            registry,
            scheduler,
            logger,
            connections: HashMap::new(),
            next_id: 0,
            running: true,
        })
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Runs until `stop` is called or a pervasive driver failure is
    /// detected (see `BATCH_SHUTDOWN_RATIO`).
    pub fn run(&mut self) {
        while self.running {
            self.accept_ready();
            self.pump_live();
        }
    }

    fn accept_ready(&mut self) {
        self.accept_poll
            .poll(&mut self.events, Some(std::time::Duration::from_millis(0)))
            .expect("accept poll failed");

        let tokens: Vec<Token> = (&self.events).into_iter().map(|e| e.token()).collect();
        for token in tokens {
            let idx = token.0 - ACCEPT_TOKEN_BASE;
            let port = match self.listeners.get(idx) {
                Some(l) => l.port,
                None => continue,
            };
            loop {
                let accepted = {
                    let listener = &self.listeners[idx];
                    listener.socket.accept()
                };
                match accepted {
                    Ok((stream, addr)) => self.register_connection(stream, port, addr),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        slog::warn!(self.logger, "accept failed"; "port" => port, "error" => format!("{}", e));
                        break;
                    }
                }
            }
        }
    }

    fn register_connection(&mut self, stream: mio::net::TcpStream, port: u16, addr: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;

        if let Err(e) = self.live_poll.register(
            &stream,
            Token(id),
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        ) {
            slog::warn!(self.logger, "failed to register connection"; "error" => format!("{}", e));
            return;
        }

        let conn = Arc::new(Mutex::new(Connection::new(id, stream, port, addr)));
        self.connections.insert(id, conn);
        slog::debug!(self.logger, "accepted connection"; "connection" => id, "port" => port, "peer" => format!("{}", addr));
    }

    fn pump_live(&mut self) {
        self.live_poll
            .poll(&mut self.events, Some(std::time::Duration::from_millis(50)))
            .expect("live poll failed");

        let batch: Vec<(Token, Ready)> =
            (&self.events).into_iter().map(|e| (e.token(), e.readiness())).collect();
        if batch.is_empty() {
            return;
        }

        let mut failures = 0usize;
        for (token, readiness) in &batch {
            let id = token.0;
            let conn = match self.connections.get(&id) {
                Some(c) => Arc::clone(c),
                None => continue,
            };

            let mut reason = None;
            if readiness.is_readable() {
                reason = Connection::on_readable(&conn, self.registry.as_ref(), &self.scheduler, &self.logger);
            }
            if reason.is_none() && readiness.is_writable() {
                reason = Connection::on_writable(&conn, &self.scheduler);
            }

            if let Some(reason) = reason {
                failures += matches!(reason, CloseReason::Abortive) as usize;
                let _ = self.live_poll.deregister(conn.lock().expect("connection mutex poisoned").stream());
                Connection::close(&conn, reason, &self.scheduler, &self.logger);
                self.connections.remove(&id);
            }
        }

        let ratio = failures as f64 / batch.len() as f64;
        if ratio >= BATCH_SHUTDOWN_RATIO {
            slog::error!(self.logger, "pervasive connection failures, shutting down driver";
                "failed" => failures, "batch_size" => batch.len());
            self.running = false;
        } else if ratio >= BATCH_WARN_RATIO {
            slog::warn!(self.logger, "elevated connection failure rate";
                "failed" => failures, "batch_size" => batch.len());
        }
    }
}

impl crate::connection::ProtocolResolver for ServiceRegistry {
    fn select_protocol(&self, port: u16, first_bytes: &[u8]) -> Option<Arc<dyn crate::protocol::Protocol>> {
        ServiceRegistry::select_protocol(self, port, first_bytes)
    }
}
