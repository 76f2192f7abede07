//! XTEA block cipher in ECB mode over 8-byte blocks, as used to encrypt the
//! login response frame with the key exchanged in the RSA-decoded block.

use byteorder::{ByteOrder, LittleEndian};

const DELTA: u32 = 0x9E37_79B9;
const ROUNDS: u32 = 32;

/// A 128-bit XTEA key, the four little-endian `u32` words read out of the
/// RSA-decoded login block.
pub type Key = [u32; 4];

fn encrypt_block(key: &Key, block: &mut [u8; 8]) {
    let mut v0 = LittleEndian::read_u32(&block[0..4]);
    let mut v1 = LittleEndian::read_u32(&block[4..8]);
    let mut sum: u32 = 0;

    for _ in 0..ROUNDS {
        v0 = v0.wrapping_add(
            (v1.wrapping_shl(4) ^ v1.wrapping_shr(5)).wrapping_add(v1)
                ^ sum.wrapping_add(key[(sum & 3) as usize]),
        );
        sum = sum.wrapping_add(DELTA);
        v1 = v1.wrapping_add(
            (v0.wrapping_shl(4) ^ v0.wrapping_shr(5)).wrapping_add(v0)
                ^ sum.wrapping_add(key[((sum >> 11) & 3) as usize]),
        );
    }

    LittleEndian::write_u32(&mut block[0..4], v0);
    LittleEndian::write_u32(&mut block[4..8], v1);
}

fn decrypt_block(key: &Key, block: &mut [u8; 8]) {
    let mut v0 = LittleEndian::read_u32(&block[0..4]);
    let mut v1 = LittleEndian::read_u32(&block[4..8]);
    let mut sum: u32 = DELTA.wrapping_mul(ROUNDS);

    for _ in 0..ROUNDS {
        v1 = v1.wrapping_sub(
            (v0.wrapping_shl(4) ^ v0.wrapping_shr(5)).wrapping_add(v0)
                ^ sum.wrapping_add(key[((sum >> 11) & 3) as usize]),
        );
        sum = sum.wrapping_sub(DELTA);
        v0 = v0.wrapping_sub(
            (v1.wrapping_shl(4) ^ v1.wrapping_shr(5)).wrapping_add(v1)
                ^ sum.wrapping_add(key[(sum & 3) as usize]),
        );
    }

    LittleEndian::write_u32(&mut block[0..4], v0);
    LittleEndian::write_u32(&mut block[4..8], v1);
}

/// Encrypts `data` in place, ECB mode. `data.len()` must be a multiple of 8;
/// the login response writer pads to that boundary before calling in.
pub fn encode(key: &Key, data: &mut [u8]) {
    debug_assert_eq!(data.len() % 8, 0, "xtea operates on 8-byte blocks");
    for block in data.chunks_mut(8) {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(block);
        encrypt_block(key, &mut buf);
        block.copy_from_slice(&buf);
    }
}

/// Decrypts `data` in place, ECB mode.
pub fn decode(key: &Key, data: &mut [u8]) {
    debug_assert_eq!(data.len() % 8, 0, "xtea operates on 8-byte blocks");
    for block in data.chunks_mut(8) {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(block);
        decrypt_block(key, &mut buf);
        block.copy_from_slice(&buf);
    }
}
