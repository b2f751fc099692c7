use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{Connect, TlsConnector};

use palaver_core::compress::{CompressionMethod, ZlibStream};
use palaver_core::xmpp::stream::{Connection, ConnectionError};

enum Socket<S> {
    Plain(S),
    Tls(TlsStream<S>),
    PlainCompressed(ZlibStream<S>),
    TlsCompressed(ZlibStream<TlsStream<S>>),
    Detached,
}

/// Outbound transport: a connected socket that can STARTTLS towards the
/// named server and take a compression filter.
pub struct ClientConnection<S = TcpStream> {
    socket: Socket<S>,
    tls: Option<(Arc<ClientConfig>, ServerName<'static>)>,
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(socket: S, tls: Option<(Arc<ClientConfig>, ServerName<'static>)>) -> Self {
        Self {
            socket: Socket::Plain(socket),
            tls,
        }
    }
}

impl<S> Connection for ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Upgrade = ClientConnectionUpgrade<S>;

    fn upgrade(self) -> Result<Self::Upgrade, ConnectionError> {
        match self.socket {
            Socket::Plain(socket) => {
                let (config, server_name) =
                    self.tls.clone().ok_or(ConnectionError::TlsUnavailable)?;
                let connect = TlsConnector::from(config).connect(server_name, socket);
                Ok(ClientConnectionUpgrade {
                    connect,
                    tls: self.tls,
                })
            }
            Socket::Tls(_) | Socket::TlsCompressed(_) => Err(ConnectionError::AlreadySecure),
            _ => Err(ConnectionError::TlsUnavailable),
        }
    }

    fn starttls_available(&self) -> bool {
        matches!(self.socket, Socket::Plain(_)) && self.tls.is_some()
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
            .export_keying_material([0u8; 32], b"EXPORTER-Channel-Binding", Some(&[]))
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

impl<S> AsyncRead for ClientConnection<S>
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

impl<S> AsyncWrite for ClientConnection<S>
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

pub struct ClientConnectionUpgrade<S> {
    connect: Connect<S>,
    tls: Option<(Arc<ClientConfig>, ServerName<'static>)>,
}

impl<S> Future for ClientConnectionUpgrade<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Output = Result<ClientConnection<S>, ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let tls_stream = ready!(Pin::new(&mut self.connect).poll(cx))?;
        Poll::Ready(Ok(ClientConnection {
            socket: Socket::Tls(tls_stream),
            tls: self.tls.take(),
        }))
    }
}
