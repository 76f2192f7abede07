//! Per-port service registry: binds 1..N protocols to a listening port,
//! with first-byte discrimination when more than one protocol shares it.

use crate::protocol::Protocol;
use std::collections::HashMap;
use std::sync::Arc;
use wardcore::error::{ErrorType, NetworkError, NetworkResult};

/// A service holds no more than this many protocols; the legacy table was
/// similarly bounded rather than growing without limit.
const MAX_PROTOCOLS_PER_SERVICE: usize = 4;

pub struct Service {
    port: u16,
    protocols: Vec<Arc<dyn Protocol>>,
}

impl Service {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol_count(&self) -> usize {
        self.protocols.len()
    }

    /// Resolves the protocol that owns a connection's first message.
    /// Single-protocol services skip identification entirely.
    pub fn select_protocol(&self, first_bytes: &[u8]) -> Option<Arc<dyn Protocol>> {
        if self.protocols.len() == 1 {
            return Some(Arc::clone(&self.protocols[0]));
        }
        self.protocols
            .iter()
            .find(|proto| proto.identify(first_bytes))
            .map(Arc::clone)
    }
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<u16, Service>,
}

impl ServiceRegistry {
    pub fn new() -> ServiceRegistry {
        ServiceRegistry { services: HashMap::new() }
    }

    /// Binds `proto` to `port`. If a service already exists there, `proto`
    /// is appended only if neither it nor the existing protocols send
    /// first -- a sends-first protocol cannot share a port since there is
    /// no first byte left for anyone else to inspect.
    pub fn add_protocol(&mut self, port: u16, proto: Arc<dyn Protocol>) -> NetworkResult<()> {
        match self.services.get_mut(&port) {
            Some(service) => {
                if service.protocols.len() >= MAX_PROTOCOLS_PER_SERVICE {
                    return Err(NetworkError::Fatal(ErrorType::Exhausted));
                }
                let incompatible =
                    proto.sends_first() || service.protocols.iter().any(|p| p.sends_first());
                if incompatible {
                    return Err(NetworkError::Fatal(ErrorType::ProtocolViolation));
                }
                service.protocols.push(proto);
            }
            None => {
                self.services.insert(port, Service { port, protocols: vec![proto] });
            }
        }
        Ok(())
    }

    pub fn service(&self, port: u16) -> Option<&Service> {
        self.services.get(&port)
    }

    pub fn select_protocol(&self, port: u16, first_bytes: &[u8]) -> Option<Arc<dyn Protocol>> {
        self.services.get(&port)?.select_protocol(first_bytes)
    }

    pub fn ports(&self) -> impl Iterator<Item = &u16> {
        self.services.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolState, Status};

    struct StubProtocol {
        name: &'static str,
        sends_first: bool,
        marker: &'static [u8],
    }

    impl Protocol for StubProtocol {
        fn name(&self) -> &'static str {
            self.name
        }
        fn sends_first(&self) -> bool {
            self.sends_first
        }
        fn identify(&self, first_bytes: &[u8]) -> bool {
            first_bytes.starts_with(self.marker)
        }
        fn create_state(&self) -> ProtocolState {
            Box::new(())
        }
        fn on_recv_message(
            &self,
            _state: &mut ProtocolState,
            _outbox: &mut dyn crate::protocol::Outbox,
            _data: &[u8],
        ) -> Status {
            Status::Ok
        }
        fn on_recv_first_message(
            &self,
            _state: &mut ProtocolState,
            _outbox: &mut dyn crate::protocol::Outbox,
            _data: &[u8],
        ) -> Status {
            Status::Ok
        }
    }

    fn stub(name: &'static str, sends_first: bool, marker: &'static [u8]) -> Arc<dyn Protocol> {
        Arc::new(StubProtocol { name, sends_first, marker })
    }

    #[test]
    fn single_protocol_service_skips_identification() {
        let mut registry = ServiceRegistry::new();
        registry.add_protocol(7777, stub("echo", false, b"ECHO")).unwrap();
        let proto = registry.select_protocol(7777, b"anything").unwrap();
        assert_eq!(proto.name(), "echo");
    }

    #[test]
    fn multi_protocol_service_discriminates_on_first_bytes() {
        let mut registry = ServiceRegistry::new();
        registry.add_protocol(7171, stub("echo", false, b"ECHO")).unwrap();
        registry.add_protocol(7171, stub("test", false, b"TST!")).unwrap();

        assert_eq!(registry.select_protocol(7171, b"TST!data").unwrap().name(), "test");
        assert_eq!(registry.select_protocol(7171, b"ECHOhi").unwrap().name(), "echo");
        assert!(registry.select_protocol(7171, b"????").is_none());
    }

    #[test]
    fn sends_first_protocol_cannot_share_a_port() {
        let mut registry = ServiceRegistry::new();
        registry.add_protocol(7172, stub("a", false, b"A")).unwrap();
        assert!(registry.add_protocol(7172, stub("b", true, b"B")).is_err());
    }

    #[test]
    fn service_table_respects_protocol_cap() {
        let mut registry = ServiceRegistry::new();
        for i in 0..MAX_PROTOCOLS_PER_SERVICE {
            let marker: &'static [u8] = Box::leak(vec![i as u8].into_boxed_slice());
            registry.add_protocol(1, stub("p", false, marker)).unwrap();
        }
        assert!(registry.add_protocol(1, stub("overflow", false, b"X")).is_err());
    }
}
