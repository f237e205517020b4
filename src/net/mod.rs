pub mod cipher;
pub mod codec;
pub mod handshake;
pub mod proto;
pub mod transport;

pub use self::codec::PacketCodec;
pub use self::proto::Packet;
pub use self::transport::{framed, Connection};

use bytes::BufMut;

use crate::error::ProtocolError;

pub const MAX_VARINT_BYTES: usize = 10;

/// Signed LEB128: 7 bits per byte, 0x80 continues, 0x40 on the last byte is the sign.
pub fn write_varint(dst: &mut impl BufMut, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Decodes a varint from the front of `src`, returning the value and the
/// number of bytes it took, or `None` if `src` ends mid-varint.
pub fn read_varint(src: &[u8]) -> Result<Option<(i64, usize)>, ProtocolError> {
    let mut result = 0i64;
    let mut shift = 0u32;
    for (i, byte) in src.iter().enumerate() {
        if i >= MAX_VARINT_BYTES {
            return Err(ProtocolError::VarIntTooLong);
        }
        result |= ((byte & 0x7f) as i64) << shift;
        shift += 7;

        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Ok(Some((result, i + 1)));
        }
    }

    if src.len() >= MAX_VARINT_BYTES {
        return Err(ProtocolError::VarIntTooLong);
    }
    Ok(None)
}

pub fn varint_size(value: i64) -> usize {
    let mut buf = Vec::with_capacity(MAX_VARINT_BYTES);
    write_varint(&mut buf, value);
    buf.len()
}
