//! Login protocol: validates the fixed 149-byte handshake, recovers the
//! account credentials and the per-session XTEA key through the pluggable
//! RSA decoder, and replies with an encrypted, checksummed character list
//! before closing. Grounded on the reference `protocol_login.c`.
//!
//! The reply's own checksum/length-prefix fields only cover the
//! checksum-plus-ciphertext portion; the outer 2-byte frame length that the
//! connection runtime's generic `Outbox` adds on every send supplies the
//! rest, so this protocol never writes its own outer length -- doing so
//! would double the field the reference implementation only had once.

use std::sync::Arc;
use wardcore::error::NetworkResult;
use wardcrypto::adler32::adler32;
use wardcrypto::rsa::RsaDecoder;
use wardcrypto::xtea::{self, Key as XteaKey};
use wardnet::protocol::{Outbox, Protocol, ProtocolState, Status};

const HANDSHAKE_LEN: usize = 149;

pub struct LoginProtocol {
    rsa: Arc<dyn RsaDecoder>,
    world_name: String,
    world_addr: u32,
    world_port: u16,
}

struct Session {
    account_name: String,
    password: String,
}

impl LoginProtocol {
    pub fn new(rsa: Arc<dyn RsaDecoder>, world_name: impl Into<String>, world_addr: u32, world_port: u16) -> LoginProtocol {
        LoginProtocol { rsa, world_name: world_name.into(), world_addr, world_port }
    }

    fn build_response(&self, xtea_key: &XteaKey) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(0x14);
        write_str(&mut body, "1\nwelcome");
        body.push(0x64);
        body.push(1);
        write_str(&mut body, "Harambe");
        write_str(&mut body, &self.world_name);
        body.extend_from_slice(&self.world_addr.to_le_bytes());
        body.extend_from_slice(&self.world_port.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());

        let bodylen = body.len() as u16;
        let mut inner = Vec::with_capacity(2 + body.len() + 8);
        inner.extend_from_slice(&bodylen.to_le_bytes());
        inner.extend_from_slice(&body);

        let padding = (8 - (inner.len() % 8)) % 8;
        inner.extend(std::iter::repeat(0x33u8).take(padding));

        xtea::encode(xtea_key, &mut inner);
        let checksum = adler32(&inner);

        let mut payload = Vec::with_capacity(4 + inner.len());
        payload.extend_from_slice(&checksum.to_le_bytes());
        payload.extend_from_slice(&inner);
        payload
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Reads a u16-length-prefixed UTF-8 string starting at `*cursor`, advancing
/// `*cursor` past it. Fails rather than panicking if the prefix or the body
/// runs past the end of `data` -- `data` is attacker-controlled plaintext
/// recovered from the RSA block.
fn read_str(data: &[u8], cursor: &mut usize) -> Option<String> {
    if *cursor + 2 > data.len() {
        return None;
    }
    let len = u16::from_le_bytes([data[*cursor], data[*cursor + 1]]) as usize;
    *cursor += 2;
    if *cursor + len > data.len() {
        return None;
    }
    let s = String::from_utf8_lossy(&data[*cursor..*cursor + len]).into_owned();
    *cursor += len;
    Some(s)
}

impl Protocol for LoginProtocol {
    fn name(&self) -> &'static str {
        "login"
    }

    fn sends_first(&self) -> bool {
        false
    }

    fn identify(&self, first_bytes: &[u8]) -> bool {
        if first_bytes.len() < 5 {
            return false;
        }
        let claimed = u32::from_le_bytes([first_bytes[0], first_bytes[1], first_bytes[2], first_bytes[3]]);
        adler32(&first_bytes[4..]) == claimed && first_bytes[4] == 0x01
    }

    fn create_state(&self) -> ProtocolState {
        Box::new(None::<Session>)
    }

    fn on_write(&self, _state: &mut ProtocolState) -> Status {
        Status::Close
    }

    fn on_recv_message(&self, _state: &mut ProtocolState, _outbox: &mut dyn Outbox, _data: &[u8]) -> Status {
        Status::Ok
    }

    fn on_recv_first_message(&self, state: &mut ProtocolState, outbox: &mut dyn Outbox, data: &[u8]) -> Status {
        if data.len() != HANDSHAKE_LEN {
            return Status::Abort;
        }

        // 4 checksum + 1 protocol id + 2 client os + 2 client version + 12 unknown = 21
        let mut cursor = 7;
        let _version = u16::from_le_bytes([data[cursor], data[cursor + 1]]);
        cursor += 2 + 12;

        let mut encrypted = data[cursor..].to_vec();
        let decoded_len = match self.rsa.decode(&mut encrypted) {
            Some(len) => len,
            None => return Status::Abort,
        };
        let plain = &encrypted[..decoded_len];
        if plain.len() < 16 {
            return Status::Abort;
        }

        let xtea_key: XteaKey = [
            u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]),
            u32::from_le_bytes([plain[4], plain[5], plain[6], plain[7]]),
            u32::from_le_bytes([plain[8], plain[9], plain[10], plain[11]]),
            u32::from_le_bytes([plain[12], plain[13], plain[14], plain[15]]),
        ];

        let mut cursor = 16;
        let account_name = match read_str(plain, &mut cursor) {
            Some(s) => s,
            None => return Status::Abort,
        };
        let password = match read_str(plain, &mut cursor) {
            Some(s) => s,
            None => return Status::Abort,
        };
        let session = Session { account_name, password };
        let _ = &session.password;

        if let Some(slot) = state.downcast_mut::<Option<Session>>() {
            *slot = Some(session);
        }

        let response = self.build_response(&xtea_key);
        let sent: NetworkResult<()> = outbox.send(&response);
        if sent.is_err() {
            return Status::Abort;
        }
        Status::Close
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wardcrypto::rsa::IdentityRsaDecoder;

    struct VecOutbox(Vec<Vec<u8>>);
    impl Outbox for VecOutbox {
        fn send(&mut self, payload: &[u8]) -> NetworkResult<()> {
            self.0.push(payload.to_vec());
            Ok(())
        }
    }

    fn handshake_message() -> Vec<u8> {
        let mut msg = vec![0u8; HANDSHAKE_LEN];
        msg[4] = 0x01;

        let xtea_key: [u32; 4] = [0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444];
        let mut plain = Vec::new();
        for word in &xtea_key {
            plain.extend_from_slice(&word.to_le_bytes());
        }
        write_str(&mut plain, "acct");
        write_str(&mut plain, "pass");

        let rsa_region_len = HANDSHAKE_LEN - 21;
        let mut rsa_region = plain;
        rsa_region.resize(rsa_region_len, 0);
        msg[21..].copy_from_slice(&rsa_region);

        let checksum = adler32(&msg[4..]);
        msg[0..4].copy_from_slice(&checksum.to_le_bytes());
        msg
    }

    #[test]
    fn identifies_well_formed_checksummed_handshake() {
        let proto = LoginProtocol::new(Arc::new(IdentityRsaDecoder), "Isara", 0x0100_007F, 7172);
        assert!(proto.identify(&handshake_message()));
    }

    #[test]
    fn rejects_message_with_bad_checksum() {
        let proto = LoginProtocol::new(Arc::new(IdentityRsaDecoder), "Isara", 0x0100_007F, 7172);
        let mut msg = handshake_message();
        msg[0] ^= 0xFF;
        assert!(!proto.identify(&msg));
    }

    #[test]
    fn wrong_length_handshake_is_aborted() {
        let proto = LoginProtocol::new(Arc::new(IdentityRsaDecoder), "Isara", 0x0100_007F, 7172);
        let mut state = proto.create_state();
        let mut outbox = VecOutbox(Vec::new());
        let status = proto.on_recv_first_message(&mut state, &mut outbox, &[0u8; 10]);
        assert_eq!(status, Status::Abort);
        assert!(outbox.0.is_empty());
    }

    #[test]
    fn well_formed_handshake_produces_one_encrypted_reply_and_closes() {
        let proto = LoginProtocol::new(Arc::new(IdentityRsaDecoder), "Isara", 0x0100_007F, 7172);
        let mut state = proto.create_state();
        let mut outbox = VecOutbox(Vec::new());
        let status = proto.on_recv_first_message(&mut state, &mut outbox, &handshake_message());
        assert_eq!(status, Status::Close);
        assert_eq!(outbox.0.len(), 1);

        let reply = &outbox.0[0];
        assert!(reply.len() > 4);
        assert_eq!((reply.len() - 4) % 8, 0);

        let checksum = u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]);
        assert_eq!(checksum, adler32(&reply[4..]));
    }

    #[test]
    fn truncated_password_length_prefix_is_aborted() {
        let mut msg = handshake_message();
        msg[4] = 0x01;
        // Overwrite the password field's length prefix to claim more bytes
        // than remain in the RSA region, without touching the handshake's
        // outer checksum (it is computed before this corruption).
        let pass_len_offset = 21 + 16 + 2 + 4;
        msg[pass_len_offset..pass_len_offset + 2].copy_from_slice(&0xFFFFu16.to_le_bytes());

        let proto = LoginProtocol::new(Arc::new(IdentityRsaDecoder), "Isara", 0x0100_007F, 7172);
        let mut state = proto.create_state();
        let mut outbox = VecOutbox(Vec::new());
        let status = proto.on_recv_first_message(&mut state, &mut outbox, &msg);
        assert_eq!(status, Status::Abort);
        assert!(outbox.0.is_empty());
    }
}
