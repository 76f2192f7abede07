//! Crate-wide error vocabulary: a fast non-fatal `Wait` case callers loop
//! on, and a `Fatal` case that carries the reason.

use std::io;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    /// Non-fatal: the caller should yield to readiness and retry later.
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    /// Slab, ring, or service table exhausted.
    Exhausted,
    /// Bad framing, unknown first bytes, or an unrecognized protocol.
    ProtocolViolation,
    /// Adler-32 mismatch or malformed RSA/XTEA layout.
    Checksum,
    /// A read or write deadline fired.
    Deadline,
    /// Config file present but unparsable; caller falls back to defaults.
    Config,
    /// Failed to bind or register a listening service.
    Bind,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl NetworkError {
    pub fn is_wait(&self) -> bool {
        matches!(self, NetworkError::Wait)
    }

    pub fn has_failed(&self) -> bool {
        !self.is_wait()
    }
}
