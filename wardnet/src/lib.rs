pub mod connection;
pub mod driver;
pub mod message;
pub mod protocol;
pub mod service;

pub use connection::{CloseReason, Connection, ConnectionId};
pub use driver::Driver;
pub use message::Message;
pub use protocol::{Outbox, Protocol, ProtocolState, Status};
pub use service::{Service, ServiceRegistry};
