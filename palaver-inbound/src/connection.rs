use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, TlsAcceptor};

use palaver_core::compress::{CompressionMethod, ZlibStream};
use palaver_core::xmpp::stream::{Connection, ConnectionError};

/// RFC 9266 `tls-exporter` channel binding: 32 bytes of keying material
/// under the EXPORTER-Channel-Binding label with an empty context.
pub(crate) const EXPORTER_LABEL: &[u8] = b"EXPORTER-Channel-Binding";
pub(crate) const EXPORTER_LEN: usize = 32;

enum Socket<S> {
    Plain(S),
    Tls(TlsStream<S>),
    PlainCompressed(ZlibStream<S>),
    TlsCompressed(ZlibStream<TlsStream<S>>),
    /// Transient placeholder while a filter swap is in flight.
    Detached,
}

/// Server-side transport: a plain accepted socket that can be upgraded to
/// TLS in band and wrapped in a compression filter. The TLS material is
/// loaded once at configuration time.
pub struct TcpConnection<S = TcpStream> {
    socket: Socket<S>,
    tls_config: Option<Arc<ServerConfig>>,
}

impl<S> TcpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(socket: S, tls_config: Option<Arc<ServerConfig>>) -> Self {
        Self {
            socket: Socket::Plain(socket),
            tls_config,
        }
    }
}

impl<S> Connection for TcpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Upgrade = TcpConnectionUpgrade<S>;

    fn upgrade(self) -> Result<Self::Upgrade, ConnectionError> {
        match self.socket {
            Socket::Plain(socket) => {
                let config = self
                    .tls_config
                    .clone()
                    .ok_or(ConnectionError::TlsUnavailable)?;
                let accept = TlsAcceptor::from(config).accept(socket);
                Ok(TcpConnectionUpgrade {
                    accept,
                    tls_config: self.tls_config,
                })
            }
            Socket::Tls(_) | Socket::TlsCompressed(_) => Err(ConnectionError::AlreadySecure),
            _ => Err(ConnectionError::TlsUnavailable),
        }
    }

    fn starttls_available(&self) -> bool {
        matches!(self.socket, Socket::Plain(_)) && self.tls_config.is_some()
    }

    fn is_secure(&self) -> bool {
        matches!(self.socket, Socket::Tls(_) | Socket::TlsCompressed(_))
    }

    fn bind_tls_unique(&self, out: &mut Vec<u8>) -> Result<(), ConnectionError> {
        let session = match &self.socket {
            Socket::Tls(stream) => stream.get_ref().1,
            Socket::TlsCompressed(stream) => stream.get_ref().get_ref().1,
            _ => return Err(ConnectionError::BindingUnavailable),
        };
        let material = session
            .export_keying_material([0u8; EXPORTER_LEN], EXPORTER_LABEL, Some(&[]))
            .map_err(|_| ConnectionError::BindingUnavailable)?;
        out.extend_from_slice(&material);
        Ok(())
    }

    fn start_compress(&mut self, method: CompressionMethod) -> Result<(), ConnectionError> {
        match std::mem::replace(&mut self.socket, Socket::Detached) {
            Socket::Plain(socket) => {
                self.socket = Socket::PlainCompressed(method.wrap(socket));
                Ok(())
            }
            Socket::Tls(socket) => {
                self.socket = Socket::TlsCompressed(method.wrap(socket));
                Ok(())
            }
            other => {
                self.socket = other;
                Err(ConnectionError::AlreadyCompressed)
            }
        }
    }
}

impl<S> AsyncRead for TcpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_read(cx, buf),
            Socket::Tls(socket) => Pin::new(socket).poll_read(cx, buf),
            Socket::PlainCompressed(socket) => Pin::new(socket).poll_read(cx, buf),
            Socket::TlsCompressed(socket) => Pin::new(socket).poll_read(cx, buf),
            Socket::Detached => Poll::Ready(Err(std::io::ErrorKind::NotConnected.into())),
        }
    }
}

impl<S> AsyncWrite for TcpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_write(cx, buf),
            Socket::Tls(socket) => Pin::new(socket).poll_write(cx, buf),
            Socket::PlainCompressed(socket) => Pin::new(socket).poll_write(cx, buf),
            Socket::TlsCompressed(socket) => Pin::new(socket).poll_write(cx, buf),
            Socket::Detached => Poll::Ready(Err(std::io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_flush(cx),
            Socket::Tls(socket) => Pin::new(socket).poll_flush(cx),
            Socket::PlainCompressed(socket) => Pin::new(socket).poll_flush(cx),
            Socket::TlsCompressed(socket) => Pin::new(socket).poll_flush(cx),
            Socket::Detached => Poll::Ready(Err(std::io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_shutdown(cx),
            Socket::Tls(socket) => Pin::new(socket).poll_shutdown(cx),
            Socket::PlainCompressed(socket) => Pin::new(socket).poll_shutdown(cx),
            Socket::TlsCompressed(socket) => Pin::new(socket).poll_shutdown(cx),
            Socket::Detached => Poll::Ready(Err(std::io::ErrorKind::NotConnected.into())),
        }
    }
}

pub struct TcpConnectionUpgrade<S> {
    accept: Accept<S>,
    tls_config: Option<Arc<ServerConfig>>,
}

impl<S> Future for TcpConnectionUpgrade<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Output = Result<TcpConnection<S>, ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let tls_stream = ready!(Pin::new(&mut self.accept).poll(cx))?;
        Poll::Ready(Ok(TcpConnection {
            socket: Socket::Tls(tls_stream),
            tls_config: self.tls_config.take(),
        }))
    }
}
