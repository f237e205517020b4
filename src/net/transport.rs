use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio_util::codec::Framed;

use super::{cipher::CipherStream, codec::PacketCodec};

/// Stages around the raw stream, outermost first: encryption, then buffering.
pub type Transport<S> = CipherStream<BufStream<S>>;

pub type Connection<S> = Framed<Transport<S>, PacketCodec>;

pub fn layer<S: AsyncRead + AsyncWrite + Unpin>(stream: S) -> Transport<S> {
    CipherStream::new(BufStream::new(stream))
}

pub fn framed<S: AsyncRead + AsyncWrite + Unpin>(stream: S) -> Connection<S> {
    Framed::new(layer(stream), PacketCodec::new())
}

/// Turns on encryption for everything after the last frame the connection
/// has yielded, including bytes it has already buffered but not decoded.
pub fn enable_encryption<S: AsyncRead + AsyncWrite + Unpin>(
    conn: Connection<S>,
    key: &[u8],
) -> Connection<S> {
    let mut parts = conn.into_parts();
    parts.io.enable(key);
    parts.io.decrypt_buffered(&mut parts.read_buf);
    Framed::from_parts(parts)
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio::io::duplex;

    use super::*;
    use crate::{
        net::{cipher::KEY_LEN, Packet},
        world::{chunk::VirtualChunk, ChunkPos, TileType},
    };

    fn sample_packets() -> Vec<Packet> {
        let mut chunk = VirtualChunk::new(ChunkPos::new(4, -9));
        chunk.set_tile(0, 1, TileType::Grass);
        vec![
            Packet::Chat {
                message: "first".to_string(),
                timestamp: 1.0,
            },
            Packet::Chunk { chunk },
            Packet::PlayerPosition { x: -3.25, y: 80.0 },
            Packet::Ping,
        ]
    }

    #[tokio::test]
    async fn framing_is_unaware_of_encryption() {
        let key: Vec<u8> = (0..KEY_LEN as u8).map(|b| b.wrapping_mul(37)).collect();
        let (a, b) = duplex(256);
        let mut tx = enable_encryption(framed(a), &key);
        let mut rx = enable_encryption(framed(b), &key);

        let packets = sample_packets();
        let sent = packets.clone();
        let writer = tokio::spawn(async move {
            for packet in sent {
                tx.send(packet).await.unwrap();
            }
            tx
        });

        for expected in packets {
            assert_eq!(rx.next().await.unwrap().unwrap(), expected);
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn switching_mid_stream_keeps_buffered_frames() {
        let key = vec![9u8; KEY_LEN];
        let (a, b) = duplex(4096);
        let mut tx = framed(a);
        let mut rx = framed(b);

        // Plain frame followed immediately by an encrypted one, read in one go.
        tx.send(Packet::Ping).await.unwrap();
        let mut tx = enable_encryption(tx, &key);
        tx.send(Packet::Chat {
            message: "secret".to_string(),
            timestamp: 2.0,
        })
        .await
        .unwrap();

        assert_eq!(rx.next().await.unwrap().unwrap(), Packet::Ping);
        let mut rx = enable_encryption(rx, &key);
        assert_eq!(
            rx.next().await.unwrap().unwrap(),
            Packet::Chat {
                message: "secret".to_string(),
                timestamp: 2.0,
            }
        );
    }
}
