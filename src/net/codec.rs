use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::{
    error::ProtocolError,
    world::{chunk::VirtualChunk, chunk::CHUNK_BYTES, ChunkPos, TileType},
};

use super::{
    proto::{tag, Packet},
    read_varint, write_varint,
};

pub const MAX_FRAME_LEN: usize = 1 << 20;
pub const MAX_STRING_LEN: usize = 1 << 16;

pub trait PacketBufExt {
    fn need(&self, len: usize) -> Result<(), ProtocolError>;
    fn get_var_int(&mut self) -> Result<i64, ProtocolError>;
    fn get_var_i32(&mut self) -> Result<i32, ProtocolError>;
    fn get_u8_checked(&mut self) -> Result<u8, ProtocolError>;
    fn get_f64_checked(&mut self) -> Result<f64, ProtocolError>;
    fn get_blob(&mut self) -> Result<Bytes, ProtocolError>;
    fn get_string(&mut self) -> Result<String, ProtocolError>;
    fn get_uuid(&mut self) -> Result<Uuid, ProtocolError>;
}

impl PacketBufExt for BytesMut {
    fn need(&self, len: usize) -> Result<(), ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Malformed("truncated packet"));
        }
        Ok(())
    }

    fn get_var_int(&mut self) -> Result<i64, ProtocolError> {
        match read_varint(&self[..])? {
            Some((value, len)) => {
                self.advance(len);
                Ok(value)
            }
            None => Err(ProtocolError::Malformed("truncated varint")),
        }
    }

    fn get_var_i32(&mut self) -> Result<i32, ProtocolError> {
        i32::try_from(self.get_var_int()?).map_err(|_| ProtocolError::Malformed("varint out of range"))
    }

    fn get_u8_checked(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.get_u8())
    }

    fn get_f64_checked(&mut self) -> Result<f64, ProtocolError> {
        self.need(8)?;
        Ok(self.get_f64_le())
    }

    fn get_blob(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.get_var_int()?;
        let len = usize::try_from(len).map_err(|_| ProtocolError::Malformed("negative length"))?;
        self.need(len)?;
        Ok(self.split_to(len).freeze())
    }

    fn get_string(&mut self) -> Result<String, ProtocolError> {
        let data = self.get_blob()?;
        if data.len() > MAX_STRING_LEN {
            return Err(ProtocolError::Malformed("string too long"));
        }
        String::from_utf8(data.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn get_uuid(&mut self) -> Result<Uuid, ProtocolError> {
        self.need(16)?;
        let mut bytes = [0u8; 16];
        self.copy_to_slice(&mut bytes);
        Ok(Uuid::from_bytes(bytes))
    }
}

pub trait PacketBufMutExt {
    fn put_var_int(&mut self, value: i64);
    fn put_blob(&mut self, data: &[u8]);
    fn put_string(&mut self, value: &str);
    fn put_uuid(&mut self, uuid: &Uuid);
}

impl PacketBufMutExt for BytesMut {
    fn put_var_int(&mut self, value: i64) {
        write_varint(self, value);
    }

    fn put_blob(&mut self, data: &[u8]) {
        self.put_var_int(data.len() as i64);
        self.put_slice(data);
    }

    fn put_string(&mut self, value: &str) {
        self.put_blob(value.as_bytes());
    }

    fn put_uuid(&mut self, uuid: &Uuid) {
        self.put_slice(uuid.as_bytes());
    }
}

enum DecoderState {
    Header,
    Body(usize),
}

/// Frames are `varint length | u16 LE tag | body`.
pub struct PacketCodec {
    decoder_state: DecoderState,
}

impl PacketCodec {
    pub fn new() -> PacketCodec {
        PacketCodec {
            decoder_state: DecoderState::Header,
        }
    }

    fn decode_body(tag: u16, buf: &mut BytesMut) -> Result<Packet, ProtocolError> {
        let packet = match tag {
            tag::CLIENT_REQUEST => Packet::ClientRequest {
                protocol_version: buf.get_var_int()?,
            },
            tag::SERVER_INFO => {
                let offline = buf.get_u8_checked()? != 0;
                buf.need(32)?;
                let mut public_key = [0u8; 32];
                buf.copy_to_slice(&mut public_key);
                Packet::ServerInfo {
                    offline,
                    public_key,
                }
            }
            tag::BASIC_AUTH => Packet::BasicAuth {
                public_key: buf.get_blob()?.to_vec(),
            },
            tag::PLAYER_INFO => Packet::PlayerInfo {
                uuid: buf.get_uuid()?,
                name: buf.get_string()?,
            },
            tag::DISCONNECT => Packet::Disconnect {
                reason: buf.get_string()?,
            },
            tag::PING => Packet::Ping,
            tag::CHUNK => {
                let pos = ChunkPos::new(buf.get_var_i32()?, buf.get_var_i32()?);
                let local_x = buf.get_var_int()?;
                let local_y = buf.get_var_int()?;
                let (expected_x, expected_y) = pos.local();
                if local_x != expected_x as i64 || local_y != expected_y as i64 {
                    return Err(ProtocolError::Malformed("chunk local coordinates disagree"));
                }
                buf.need(CHUNK_BYTES)?;
                let record = buf.split_to(CHUNK_BYTES);
                let chunk = VirtualChunk::from_bytes(pos, &record)
                    .ok_or(ProtocolError::Malformed("short chunk record"))?;
                Packet::Chunk { chunk }
            }
            tag::CHUNK_UNLOAD => Packet::ChunkUnload {
                pos: ChunkPos::new(buf.get_var_i32()?, buf.get_var_i32()?),
            },
            tag::CHUNK_UPDATE => {
                let chunk = ChunkPos::new(buf.get_var_i32()?, buf.get_var_i32()?);
                let x = buf.get_u8_checked()?;
                let y = buf.get_u8_checked()?;
                if x >= 16 || y >= 16 {
                    return Err(ProtocolError::Malformed("tile outside of chunk"));
                }
                Packet::ChunkUpdate {
                    chunk,
                    x,
                    y,
                    tile: TileType::from(buf.get_u8_checked()?),
                }
            }
            tag::PLAYER_POSITION => Packet::PlayerPosition {
                x: buf.get_f64_checked()?,
                y: buf.get_f64_checked()?,
            },
            tag::ADD_VELOCITY => Packet::AddVelocity {
                x: buf.get_f64_checked()?,
                y: buf.get_f64_checked()?,
            },
            tag::CHAT => Packet::Chat {
                message: buf.get_string()?,
                timestamp: buf.get_f64_checked()?,
            },
            _ => return Err(ProtocolError::UnknownTag(tag)),
        };

        if buf.has_remaining() {
            return Err(ProtocolError::Malformed("trailing bytes after packet"));
        }
        Ok(packet)
    }

    fn encode_body(packet: &Packet, buf: &mut BytesMut) {
        buf.put_u16_le(packet.tag());
        match packet {
            Packet::ClientRequest { protocol_version } => buf.put_var_int(*protocol_version),
            Packet::ServerInfo {
                offline,
                public_key,
            } => {
                buf.put_u8(*offline as u8);
                buf.put_slice(public_key);
            }
            Packet::BasicAuth { public_key } => buf.put_blob(public_key),
            Packet::PlayerInfo { uuid, name } => {
                buf.put_uuid(uuid);
                buf.put_string(name);
            }
            Packet::Disconnect { reason } => buf.put_string(reason),
            Packet::Ping => {}
            Packet::Chunk { chunk } => {
                let (local_x, local_y) = chunk.pos.local();
                buf.put_var_int(chunk.pos.x as i64);
                buf.put_var_int(chunk.pos.y as i64);
                buf.put_var_int(local_x as i64);
                buf.put_var_int(local_y as i64);
                buf.put_slice(chunk.record());
            }
            Packet::ChunkUnload { pos } => {
                buf.put_var_int(pos.x as i64);
                buf.put_var_int(pos.y as i64);
            }
            Packet::ChunkUpdate { chunk, x, y, tile } => {
                buf.put_var_int(chunk.x as i64);
                buf.put_var_int(chunk.y as i64);
                buf.put_u8(*x);
                buf.put_u8(*y);
                buf.put_u8(tile.id());
            }
            Packet::PlayerPosition { x, y } | Packet::AddVelocity { x, y } => {
                buf.put_f64_le(*x);
                buf.put_f64_le(*y);
            }
            Packet::Chat { message, timestamp } => {
                buf.put_string(message);
                buf.put_f64_le(*timestamp);
            }
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;

    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.decoder_state {
                DecoderState::Header => {
                    let (len, header_len) = match read_varint(&src[..])? {
                        Some(header) => header,
                        None => return Ok(None),
                    };
                    let len = usize::try_from(len)
                        .map_err(|_| ProtocolError::Malformed("negative frame length"))?;
                    if len > MAX_FRAME_LEN {
                        return Err(ProtocolError::FrameTooLarge(len));
                    }
                    if len < 2 {
                        return Err(ProtocolError::Malformed("frame without tag"));
                    }

                    src.advance(header_len);
                    src.reserve(len);
                    self.decoder_state = DecoderState::Body(len);
                }
                DecoderState::Body(len) => {
                    if src.remaining() < len {
                        return Ok(None);
                    }
                    self.decoder_state = DecoderState::Header;

                    let mut payload = src.split_to(len);
                    let tag = payload.get_u16_le();
                    trace!("Decoding packet {:#06x} with length {}", tag, len);
                    return Self::decode_body(tag, &mut payload).map(Some);
                }
            }
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        Self::encode_body(&item, &mut body);
        if body.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(body.len()));
        }

        write_varint(dst, body.len() as i64);
        dst.extend_from_slice(&body);
        trace!("Encoded {} ({} bytes)", item.name(), body.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::chunk;

    fn encode(packet: Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        PacketCodec::new().encode(packet, &mut buf).unwrap();
        buf
    }

    fn decode_all(buf: &mut BytesMut) -> Vec<Packet> {
        let mut codec = PacketCodec::new();
        let mut out = Vec::new();
        while let Some(packet) = codec.decode(buf).unwrap() {
            out.push(packet);
        }
        out
    }

    #[test]
    fn frame_layout() {
        let buf = encode(Packet::ChunkUnload {
            pos: ChunkPos::new(-1, 64),
        });
        // len=5, tag 0x0007 LE, -1, 64 (two bytes)
        assert_eq!(&buf[..], &[0x05, 0x07, 0x00, 0x7f, 0xc0, 0x00]);
    }

    #[test]
    fn chunk_record_is_sent_verbatim() {
        let mut chunk = VirtualChunk::new(ChunkPos::new(-17, 3));
        chunk.set_tile(15, 15, TileType::Leaves);
        chunk::mark_generated(chunk.record_mut());
        let mut buf = encode(Packet::Chunk {
            chunk: chunk.clone(),
        });

        let tail = &buf[buf.len() - CHUNK_BYTES..];
        assert_eq!(tail, &chunk.record()[..]);

        let packets = decode_all(&mut buf);
        assert_eq!(packets, vec![Packet::Chunk { chunk }]);
    }

    #[test]
    fn decodes_across_partial_reads() {
        let mut wire = BytesMut::new();
        let mut codec = PacketCodec::new();
        let packets = vec![
            Packet::ClientRequest {
                protocol_version: 1,
            },
            Packet::PlayerInfo {
                uuid: Uuid::from_u128(0xdead_beef),
                name: "viewer".to_string(),
            },
            Packet::Chat {
                message: "hello wörld".to_string(),
                timestamp: 1234.5,
            },
            Packet::Ping,
            Packet::ChunkUpdate {
                chunk: ChunkPos::new(2, -2),
                x: 3,
                y: 15,
                tile: TileType::Torch,
            },
        ];
        for packet in packets.clone() {
            codec.encode(packet, &mut wire).unwrap();
        }

        let mut decoded = Vec::new();
        let mut src = BytesMut::new();
        for byte in wire.iter() {
            src.put_u8(*byte);
            if let Some(packet) = codec.decode(&mut src).unwrap() {
                decoded.push(packet);
            }
        }
        assert_eq!(decoded, packets);
    }

    #[test]
    fn unknown_tag_is_fatal() {
        let mut buf = BytesMut::from(&[0x02, 0xff, 0x7f][..]);
        assert!(matches!(
            PacketCodec::new().decode(&mut buf),
            Err(ProtocolError::UnknownTag(0x7fff))
        ));
    }

    #[test]
    fn truncated_body_is_malformed() {
        // player-position with only 4 of its 16 bytes
        let mut buf = BytesMut::from(&[0x06, 0x09, 0x00, 1, 2, 3, 4][..]);
        assert!(matches!(
            PacketCodec::new().decode(&mut buf),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut buf = BytesMut::from(&[0x03, 0x05, 0x00, 0x00][..]);
        assert!(matches!(
            PacketCodec::new().decode(&mut buf),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, (MAX_FRAME_LEN + 1) as i64);
        assert!(matches!(
            PacketCodec::new().decode(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn unknown_tile_ids_decode_as_air() {
        let mut buf = BytesMut::from(&[0x07, 0x08, 0x00, 0x00, 0x00, 0x01, 0x02, 0xee][..]);
        assert_eq!(
            decode_all(&mut buf),
            vec![Packet::ChunkUpdate {
                chunk: ChunkPos::new(0, 0),
                x: 1,
                y: 2,
                tile: TileType::Air,
            }]
        );
    }

    #[test]
    fn mismatched_chunk_locals_are_rejected() {
        let mut body = BytesMut::new();
        body.put_u16_le(tag::CHUNK);
        body.put_var_int(1);
        body.put_var_int(1);
        body.put_var_int(2);
        body.put_var_int(1);
        body.put_slice(&[0u8; CHUNK_BYTES]);
        let mut buf = BytesMut::new();
        write_varint(&mut buf, body.len() as i64);
        buf.extend_from_slice(&body);
        assert!(matches!(
            PacketCodec::new().decode(&mut buf),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
