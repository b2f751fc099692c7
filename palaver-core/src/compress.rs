//! Stream compression filters installed during feature negotiation.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const CHUNK_SIZE: usize = 4096;

/// A negotiable compression method. The registry maps XEP-0138 method
/// names onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Zlib,
}

impl CompressionMethod {
    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::Zlib => "zlib",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "zlib" => Some(CompressionMethod::Zlib),
            _ => None,
        }
    }

    pub fn wrap<S>(self, io: S) -> ZlibStream<S> {
        match self {
            CompressionMethod::Zlib => ZlibStream::new(io),
        }
    }
}

/// Bidirectional zlib filter over a byte stream.
///
/// Every write is deflated with a sync flush so each stanza reaches the
/// peer without waiting for more data. Reads inflate whatever the
/// transport yields and serve the surplus from an internal buffer, so a
/// read never interleaves with a write mid-frame.
pub struct ZlibStream<S> {
    io: S,
    compress: Compress,
    decompress: Decompress,
    write_pending: BytesMut,
    read_raw: Box<[u8]>,
    read_decoded: BytesMut,
}

impl<S> ZlibStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            compress: Compress::new(Compression::default(), true),
            decompress: Decompress::new(true),
            write_pending: BytesMut::new(),
            read_raw: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
            read_decoded: BytesMut::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn into_inner(self) -> S {
        self.io
    }

    fn deflate(&mut self, input: &[u8]) -> io::Result<()> {
        let mut consumed = 0;
        loop {
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            let mut out = [0u8; CHUNK_SIZE];
            let status = self
                .compress
                .compress(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(io::Error::other)?;
            let used = (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;
            consumed += used;
            self.write_pending.extend_from_slice(&out[..produced]);

            match status {
                Status::Ok | Status::BufError => {
                    // A sync flush that did not fill the output buffer is
                    // complete once all input is consumed.
                    if consumed == input.len() && produced < out.len() {
                        return Ok(());
                    }
                    if used == 0 && produced == 0 {
                        return Ok(());
                    }
                }
                Status::StreamEnd => return Ok(()),
            }
        }
    }

    fn inflate(&mut self, input: &[u8]) -> io::Result<()> {
        let mut consumed = 0;
        while consumed < input.len() {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let mut out = [0u8; CHUNK_SIZE];
            let status = self
                .decompress
                .decompress(&input[consumed..], &mut out, FlushDecompress::None)
                .map_err(io::Error::other)?;
            let used = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            consumed += used;
            self.read_decoded.extend_from_slice(&out[..produced]);

            if status == Status::StreamEnd || (used == 0 && produced == 0) {
                break;
            }
        }
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ZlibStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        loop {
            if !me.read_decoded.is_empty() {
                let n = std::cmp::min(buf.remaining(), me.read_decoded.len());
                buf.put_slice(&me.read_decoded.split_to(n));
                return Poll::Ready(Ok(()));
            }

            let mut raw = ReadBuf::new(&mut me.read_raw);
            ready!(Pin::new(&mut me.io).poll_read(cx, &mut raw))?;
            if raw.filled().is_empty() {
                return Poll::Ready(Ok(()));
            }
            let filled = raw.filled().to_vec();
            me.inflate(&filled)?;
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ZlibStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;

        // Finish handing off previously deflated bytes first so frames stay
        // ordered.
        while !me.write_pending.is_empty() {
            let n = ready!(Pin::new(&mut me.io).poll_write(cx, &me.write_pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            me.write_pending.advance(n);
        }

        me.deflate(buf)?;

        // Best effort immediate hand-off; leftovers go out on the next
        // write or flush.
        while !me.write_pending.is_empty() {
            match Pin::new(&mut me.io).poll_write(cx, &me.write_pending) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => me.write_pending.advance(n),
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => break,
            }
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = &mut *self;
        while !me.write_pending.is_empty() {
            let n = ready!(Pin::new(&mut me.io).poll_write(cx, &me.write_pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            me.write_pending.advance(n);
        }
        Pin::new(&mut me.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn zlib_round_trip() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let mut writer = ZlibStream::new(a);
        let mut reader = ZlibStream::new(b);

        writer.write_all(b"hello world\n").await.unwrap();
        writer.flush().await.unwrap();

        let mut read = vec![0u8; 12];
        reader.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"hello world\n");
    }

    #[tokio::test]
    async fn each_write_is_flushed_through() {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let mut writer = ZlibStream::new(a);
        let mut reader = ZlibStream::new(b);

        // No explicit flush between stanzas; the sync flush per write must
        // make each one readable on its own.
        writer.write_all(b"<iq type='get' id='1'/>").await.unwrap();
        let mut read = vec![0u8; 23];
        reader.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"<iq type='get' id='1'/>");

        writer.write_all(b"<iq type='get' id='2'/>").await.unwrap();
        reader.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"<iq type='get' id='2'/>");
    }

    #[tokio::test]
    async fn large_payload_round_trip() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let (a, b) = tokio::io::duplex(16 * 1024);
        let mut writer = ZlibStream::new(a);
        let mut reader = ZlibStream::new(b);

        let expected = payload.clone();
        let write = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.flush().await.unwrap();
        });

        let mut read = vec![0u8; expected.len()];
        reader.read_exact(&mut read).await.unwrap();
        write.await.unwrap();
        assert_eq!(read, expected);
    }

    #[test]
    fn method_registry_names() {
        assert_eq!(CompressionMethod::from_name("zlib"), Some(CompressionMethod::Zlib));
        assert_eq!(CompressionMethod::from_name("lzw"), None);
        assert_eq!(CompressionMethod::Zlib.name(), "zlib");
    }
}
