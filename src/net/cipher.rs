use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub const KEY_LEN: usize = 64;

/// Position-dependent additive stream transform.
///
/// Byte `i` of the stream is shifted by `key[(offset + i) % (key.len() - 1)]`,
/// so the last key byte is never used. Encrypting and decrypting with equal
/// key and starting offset are inverse, and splitting the input across calls
/// does not change the output.
#[derive(Clone)]
pub struct StreamCipher {
    key: Vec<u8>,
    offset: usize,
}

impl StreamCipher {
    pub fn new(key: &[u8]) -> StreamCipher {
        Self::with_offset(key, 0)
    }

    pub fn with_offset(key: &[u8], offset: usize) -> StreamCipher {
        assert!(key.len() >= 2, "stream cipher key must be at least two bytes");
        StreamCipher {
            key: key.to_vec(),
            offset: offset % (key.len() - 1),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn period(&self) -> usize {
        self.key.len() - 1
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        let period = self.period();
        for byte in data.iter_mut() {
            *byte = byte.wrapping_add(self.key[self.offset]);
            self.offset = (self.offset + 1) % period;
        }
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        let period = self.period();
        for byte in data.iter_mut() {
            *byte = byte.wrapping_sub(self.key[self.offset]);
            self.offset = (self.offset + 1) % period;
        }
    }
}

/// Encryption stage. Passes bytes through untouched until `enable` is called.
pub struct CipherStream<S> {
    inner: S,
    read: Option<StreamCipher>,
    write: Option<StreamCipher>,
    pending: BytesMut,
}

impl<S> CipherStream<S> {
    pub fn new(inner: S) -> CipherStream<S> {
        CipherStream {
            inner,
            read: None,
            write: None,
            pending: BytesMut::new(),
        }
    }

    /// Switches both directions to `key`, each starting at offset 0.
    pub fn enable(&mut self, key: &[u8]) {
        self.read = Some(StreamCipher::new(key));
        self.write = Some(StreamCipher::new(key));
    }

    pub fn is_encrypted(&self) -> bool {
        self.read.is_some()
    }

    /// Decrypts bytes that were read through this stage before `enable`
    /// but belong to the encrypted part of the stream.
    pub fn decrypt_buffered(&mut self, data: &mut [u8]) {
        if let Some(cipher) = &mut self.read {
            cipher.decrypt(data);
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> CipherStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(cipher) = &mut this.read {
            cipher.decrypt(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write.is_none() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        // Encrypted bytes are committed once accepted, so the previous batch
        // has to reach the inner stream before new ones are taken.
        ready!(this.poll_drain(cx))?;
        let start = this.pending.len();
        this.pending.extend_from_slice(buf);
        if let Some(cipher) = &mut this.write {
            cipher.encrypt(&mut this.pending[start..]);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, RngCore};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn random_key(len: usize) -> Vec<u8> {
        let mut key = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn decrypt_inverts_encrypt() {
        let key = random_key(KEY_LEN);
        let mut data = vec![0u8; 1000];
        rand::thread_rng().fill_bytes(&mut data);
        let original = data.clone();

        for offset in [0, 1, KEY_LEN - 2, KEY_LEN + 5] {
            StreamCipher::with_offset(&key, offset).encrypt(&mut data);
            assert_ne!(data, original);
            StreamCipher::with_offset(&key, offset).decrypt(&mut data);
            assert_eq!(data, original);
        }
    }

    #[test]
    fn split_writes_match_one_write() {
        let key = random_key(7);
        let mut data = vec![0u8; 200];
        rand::thread_rng().fill_bytes(&mut data);

        let mut whole = data.clone();
        StreamCipher::new(&key).encrypt(&mut whole);

        let mut cipher = StreamCipher::new(&key);
        let mut split = data.clone();
        let mut rest = &mut split[..];
        while !rest.is_empty() {
            let n = rand::thread_rng().gen_range(1..=rest.len().min(13));
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(n);
            cipher.encrypt(head);
            rest = tail;
        }
        assert_eq!(split, whole);
        assert_eq!(cipher.offset(), 200 % 6);
    }

    #[test]
    fn offset_wraps_before_last_key_byte() {
        let key = [1u8, 2, 3, 100];
        let mut data = [0u8; 7];
        StreamCipher::new(&key).encrypt(&mut data);
        assert_eq!(data, [1, 2, 3, 1, 2, 3, 1]);
    }

    #[tokio::test]
    async fn encrypted_stream_round_trips() {
        let key = random_key(KEY_LEN);
        let (a, b) = duplex(64);
        let mut writer = CipherStream::new(a);
        let mut reader = CipherStream::new(b);
        writer.enable(&key);
        reader.enable(&key);

        let mut payload = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut payload);
        let expected = payload.clone();

        let write = tokio::spawn(async move {
            for part in payload.chunks(333) {
                writer.write_all(part).await.unwrap();
            }
            writer.flush().await.unwrap();
            writer
        });

        let mut received = vec![0u8; expected.len()];
        reader.read_exact(&mut received).await.unwrap();
        write.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn bytes_on_the_wire_are_transformed() {
        let key = random_key(KEY_LEN);
        let (a, mut b) = duplex(1024);
        let mut writer = CipherStream::new(a);
        writer.enable(&key);
        writer.write_all(b"plain text").await.unwrap();
        writer.flush().await.unwrap();

        let mut raw = [0u8; 10];
        b.read_exact(&mut raw).await.unwrap();
        assert_ne!(&raw, b"plain text");
        StreamCipher::new(&key).decrypt(&mut raw);
        assert_eq!(&raw, b"plain text");
    }
}
