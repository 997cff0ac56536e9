//! Streaming helpers for attachment bytes.
//!
//! Incoming bytes are hashed on their way into storage, so the content
//! address of an upload is known as soon as its last byte is written
//! and the received length can be checked against the declared size
//! without reading the object back.

use std::marker::Unpin;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use digest::{Digest, Output as DigestOutput};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::OnceCell;

/// What a [`StreamHasher`] saw once its source ran dry.
pub struct Receipt<D: Digest> {
    /// Digest over every byte that passed through.
    pub digest: DigestOutput<D>,

    /// Number of bytes that passed through.
    pub size: u64,
}

/// Shared slot the receipt is published to at EOF.
pub type ReceiptCell<D> = Arc<OnceCell<Receipt<D>>>;

/// Reader that digests and counts the bytes of an upload.
///
/// The receipt stays empty until the wrapped reader reports EOF. An
/// empty receipt after the copy finished means the transfer was cut
/// short, and a receipt whose size differs from what the client
/// declared means the body was truncated or padded.
pub struct StreamHasher<R: AsyncRead + Unpin, D: Digest + Unpin> {
    inner: R,
    state: Option<D>,
    size: u64,
    receipt: ReceiptCell<D>,
}

impl<R: AsyncRead + Unpin, D: Digest + Unpin> StreamHasher<R, D> {
    pub fn new(inner: R, digest: D) -> (Self, ReceiptCell<D>) {
        let receipt = Arc::new(OnceCell::new());

        let hasher = Self {
            inner,
            state: Some(digest),
            size: 0,
            receipt: receipt.clone(),
        };

        (hasher, receipt)
    }

    fn finish(&mut self) {
        if let Some(state) = self.state.take() {
            let _ = self.receipt.set(Receipt {
                digest: state.finalize(),
                size: self.size,
            });
        }
    }
}

impl<R: AsyncRead + Unpin, D: Digest + Unpin> AsyncRead for StreamHasher<R, D> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<tokio::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let fresh = &buf.filled()[before..];
        if fresh.is_empty() {
            this.finish();
        } else if let Some(state) = this.state.as_mut() {
            state.update(fresh);
            this.size += fresh.len() as u64;
        }

        Poll::Ready(Ok(()))
    }
}

/// Fills `chunk` up to its capacity from the stream.
///
/// The result is only shorter than the capacity if the stream ended.
pub async fn read_chunk_async<S: AsyncRead + Unpin + Send>(
    stream: &mut S,
    mut chunk: BytesMut,
) -> std::io::Result<Bytes> {
    while chunk.len() < chunk.capacity() {
        if stream.read_buf(&mut chunk).await? == 0 {
            break;
        }
    }

    Ok(chunk.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io;
    use tokio_test::block_on;

    use crate::hash::Hash;

    fn receipt_hash(receipt: &Receipt<sha2::Sha256>) -> Hash {
        Hash::from_sha256_digest(receipt.digest.as_slice()).unwrap()
    }

    #[test]
    fn test_receipt_matches_content_address() {
        let body = b"GIF89a tiny cat";
        let (mut hasher, receipt) = StreamHasher::new(body.as_slice(), sha2::Sha256::new());

        // Small reads, like a slow client
        let mut buf = [0u8; 4];
        let mut received = Vec::new();
        loop {
            let n = block_on(hasher.read(&mut buf)).unwrap();
            if n == 0 {
                break;
            }
            assert!(receipt.get().is_none());
            received.extend_from_slice(&buf[..n]);
        }

        let receipt = receipt.get().expect("EOF should publish the receipt");
        assert_eq!(body.as_slice(), received.as_slice());
        assert_eq!(body.len() as u64, receipt.size);
        assert_eq!(Hash::sha256_from_bytes(body), receipt_hash(receipt));
    }

    #[test]
    fn test_truncated_upload() {
        // The client declared 100 bytes but hung up after 5
        let declared = 100u64;
        let (mut hasher, receipt) = StreamHasher::new(b"hello".as_slice(), sha2::Sha256::new());

        block_on(io::copy(&mut hasher, &mut io::sink())).unwrap();

        let receipt = receipt.get().unwrap();
        assert_ne!(declared, receipt.size);
        assert_eq!(5, receipt.size);
    }

    #[test]
    fn test_empty_upload() {
        let (mut hasher, receipt) = StreamHasher::new(b"".as_slice(), sha2::Sha256::new());
        block_on(io::copy(&mut hasher, &mut io::sink())).unwrap();

        let receipt = receipt.get().unwrap();
        assert_eq!(0, receipt.size);
        assert_eq!(Hash::sha256_from_bytes(b""), receipt_hash(receipt));
    }

    #[test]
    fn test_read_chunk_async() {
        let mut stream: &[u8] = b"0123456789";

        block_on(async {
            let first = read_chunk_async(&mut stream, BytesMut::with_capacity(4)).await.unwrap();
            let second = read_chunk_async(&mut stream, BytesMut::with_capacity(4)).await.unwrap();
            let rest = read_chunk_async(&mut stream, BytesMut::with_capacity(4)).await.unwrap();
            let end = read_chunk_async(&mut stream, BytesMut::with_capacity(4)).await.unwrap();

            assert_eq!(b"0123".as_slice(), first.as_ref());
            assert_eq!(b"4567".as_slice(), second.as_ref());
            assert_eq!(b"89".as_slice(), rest.as_ref());
            assert!(end.is_empty());
        });
    }
}
