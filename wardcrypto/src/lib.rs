//! Cryptographic primitives consumed by the login handshake: a real
//! Adler-32 checksum, a real XTEA block cipher, and an RSA-decode contract
//! treated as an external black box.

pub mod adler32;
pub mod rsa;
pub mod xtea;

pub use adler32::adler32;
pub use rsa::{IdentityRsaDecoder, RsaDecoder};
pub use xtea::Key as XteaKey;
