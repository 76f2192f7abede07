//! ECHO protocol: identifies on a 4-byte `"ECHO"` marker, then echoes back
//! whatever it's given, truncated to the single-frame payload ceiling.
//! Grounded on the reference `protocol_echo.c`: a connection may only have
//! one echo in flight at a time, gated by `output_ready`, which the
//! connection runtime flips back on once the previous send has drained.

use wardnet::message::ECHO_MAX_PAYLOAD;
use wardnet::protocol::{Outbox, Protocol, ProtocolState, Status};

const MARKER: &[u8] = b"ECHO";

struct EchoState {
    output_ready: bool,
}

pub struct EchoProtocol;

impl Protocol for EchoProtocol {
    fn name(&self) -> &'static str {
        "ECHO"
    }

    fn sends_first(&self) -> bool {
        false
    }

    fn identify(&self, first_bytes: &[u8]) -> bool {
        first_bytes.starts_with(MARKER)
    }

    fn create_state(&self) -> ProtocolState {
        Box::new(EchoState { output_ready: true })
    }

    fn on_write(&self, state: &mut ProtocolState) -> Status {
        if let Some(s) = state.downcast_mut::<EchoState>() {
            s.output_ready = true;
        }
        Status::Ok
    }

    fn on_recv_message(&self, state: &mut ProtocolState, outbox: &mut dyn Outbox, data: &[u8]) -> Status {
        let s = match state.downcast_mut::<EchoState>() {
            Some(s) => s,
            None => return Status::Abort,
        };

        if s.output_ready {
            let len = data.len().min(ECHO_MAX_PAYLOAD);
            if outbox.send(&data[..len]).is_ok() {
                s.output_ready = false;
            }
        }
        Status::Ok
    }

    fn on_recv_first_message(&self, state: &mut ProtocolState, outbox: &mut dyn Outbox, data: &[u8]) -> Status {
        // The marker bytes aren't part of the echoed payload.
        let body = if data.len() >= MARKER.len() { &data[MARKER.len()..] } else { &[] };
        self.on_recv_message(state, outbox, body)
    }
}
