//! The uniform handler contract the connection runtime drives: a
//! capability set (not a base class) so concrete protocols are tagged
//! implementations rather than a type hierarchy. Protocol state is type
//! erased (`Box<dyn Any + Send>`) so a `Service` can hold heterogeneous
//! protocols behind one vtable.

use std::any::Any;
use wardcore::error::NetworkResult;

/// Three-valued result every handler entry point returns: `Ok` keeps the
/// connection going, `Close` drains output then tears down, `Abort`
/// discards output and tears down immediately.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Status {
    Ok,
    Close,
    Abort,
}

/// What a protocol handler uses to talk back to its connection. The
/// connection runtime implements this; protocols never see the socket or
/// the output queue directly.
pub trait Outbox {
    /// Enqueues `payload` for the connection to frame and send. Enforces
    /// the bounded-output-queue backpressure rule: an overflow is reported
    /// as an error and the caller should close the connection.
    fn send(&mut self, payload: &[u8]) -> NetworkResult<()>;
}

pub type ProtocolState = Box<dyn Any + Send>;

pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// Protocols that write before reading cannot share a port with
    /// other protocols (the service registry enforces this).
    fn sends_first(&self) -> bool;

    /// Whether this protocol owns a connection whose first bytes are
    /// `first_bytes`. Skipped for single-protocol services.
    fn identify(&self, first_bytes: &[u8]) -> bool;

    fn create_state(&self) -> ProtocolState;

    fn destroy_state(&self, _state: ProtocolState) {}

    fn on_connect(&self, _state: &mut ProtocolState) -> Status {
        Status::Ok
    }

    fn on_close(&self, _state: &mut ProtocolState) {}

    fn on_write(&self, _state: &mut ProtocolState) -> Status {
        Status::Ok
    }

    fn on_recv_message(&self, state: &mut ProtocolState, outbox: &mut dyn Outbox, data: &[u8]) -> Status;

    fn on_recv_first_message(
        &self,
        state: &mut ProtocolState,
        outbox: &mut dyn Outbox,
        data: &[u8],
    ) -> Status;
}
