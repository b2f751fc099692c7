use std::future::Future;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::compress::CompressionMethod;
use crate::xml::Element;
use crate::xml::stream_codec::{Frame, FramingError, WirePacket, XmlStreamCodec};
use crate::xmpp::jid::JidError;
use crate::xmpp::stream_header::{Framing, PartAttr};

pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport is already secure")]
    AlreadySecure,
    #[error("starttls is not available on this transport")]
    TlsUnavailable,
    #[error("channel binding is not available on this transport")]
    BindingUnavailable,
    #[error("compression is already active")]
    AlreadyCompressed,
    #[error("compression is not available on this transport")]
    CompressionUnavailable,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("channel closed")]
    Closed,
    #[error("not a stream header start")]
    NotHeaderStart,
    #[error("stream header not for this domain")]
    NotForThisDomain,
    #[error("improper from attribute")]
    ImproperFromAttr,
    #[error(transparent)]
    Jid(#[from] JidError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The transport a stream runs over.
///
/// The connection exclusively owns the socket and any active filters; TLS
/// and compression transitions swap the transport in place. Both happen
/// between a send and the next read, which the negotiation serialization
/// guarantees.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + Sized + 'static {
    type Upgrade: Future<Output = Result<Self, ConnectionError>> + Send;

    /// Starts the in-band TLS handshake. Consumes the plain transport and
    /// resolves to the secured one.
    fn upgrade(self) -> Result<Self::Upgrade, ConnectionError>;
    fn starttls_available(&self) -> bool;
    fn is_secure(&self) -> bool;
    /// Writes the channel-binding exporter value of the TLS session.
    fn bind_tls_unique(&self, out: &mut Vec<u8>) -> Result<(), ConnectionError>;
    /// Installs a bidirectional compression filter over the transport.
    fn start_compress(&mut self, method: CompressionMethod) -> Result<(), ConnectionError>;
}

/// In-process pipe transport, usable wherever a real socket is.
impl Connection for DuplexStream {
    type Upgrade = std::future::Ready<Result<Self, ConnectionError>>;

    fn upgrade(self) -> Result<Self::Upgrade, ConnectionError> {
        Err(ConnectionError::TlsUnavailable)
    }

    fn starttls_available(&self) -> bool {
        false
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn bind_tls_unique(&self, _out: &mut Vec<u8>) -> Result<(), ConnectionError> {
        Err(ConnectionError::BindingUnavailable)
    }

    fn start_compress(&mut self, _method: CompressionMethod) -> Result<(), ConnectionError> {
        Err(ConnectionError::CompressionUnavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    WsOpened,
    TcpOpened,
    Closed,
}

/// The framed stream wrapper: owns the connection, the framer and the
/// serializer, and performs the open/close handshakes.
///
/// Within one stream the state only ever advances
/// `Init → {Tcp,Ws}Opened → Closed`; a stream restart rebuilds the codec
/// and returns the state to `Init` without touching negotiated identity.
pub struct Channel<C: Connection> {
    framed: Option<Framed<C, XmlStreamCodec>>,
    state: ChannelState,
    is_server: bool,
    max_stanza_size: usize,
    close_grace: Duration,
}

impl<C: Connection> Channel<C> {
    pub fn new(connection: C, is_server: bool, max_stanza_size: usize) -> Self {
        Self {
            framed: Some(Framed::new(
                connection,
                XmlStreamCodec::new(max_stanza_size),
            )),
            state: ChannelState::Init,
            is_server,
            max_stanza_size,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }

    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.close_grace = close_grace;
        self
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    fn framed(&mut self) -> Result<&mut Framed<C, XmlStreamCodec>, StreamError> {
        self.framed.as_mut().ok_or(StreamError::Closed)
    }

    pub fn is_secure(&self) -> bool {
        self.framed
            .as_ref()
            .is_some_and(|framed| framed.get_ref().is_secure())
    }

    pub fn starttls_available(&self) -> bool {
        self.framed
            .as_ref()
            .is_some_and(|framed| framed.get_ref().starttls_available())
    }

    pub fn bind_tls_unique(&self, out: &mut Vec<u8>) -> Result<(), ConnectionError> {
        match &self.framed {
            Some(framed) => framed.get_ref().bind_tls_unique(out),
            None => Err(ConnectionError::BindingUnavailable),
        }
    }

    /// Sends the XML prolog and this side's stream header.
    pub async fn open(&mut self, attr: &PartAttr) -> Result<(), StreamError> {
        let header = if self.is_server {
            attr.to_client_header()
        } else {
            attr.to_server_header()
        };
        let framed = self.framed()?;
        framed.feed(WirePacket::Declaration).await?;
        framed.send(WirePacket::OpenHeader(header)).await?;
        self.state = match attr.framing {
            Framing::Open => ChannelState::WsOpened,
            Framing::Stream => ChannelState::TcpOpened,
        };
        Ok(())
    }

    /// Reads frames until the peer's open header arrives and absorbs it
    /// into `attr`. A stanza before the header is a protocol error.
    pub async fn wait_header(&mut self, attr: &mut PartAttr) -> Result<(), StreamError> {
        loop {
            match self.next_frame().await? {
                Some(Frame::Declaration) | Some(Frame::Whitespace(_)) => continue,
                Some(Frame::StreamStart(header)) => {
                    if self.is_server {
                        attr.read_client_header(&header)?;
                    } else {
                        attr.read_server_header(&header)?;
                    }
                    return Ok(());
                }
                Some(Frame::StanzaElement(_)) => return Err(StreamError::NotHeaderStart),
                Some(Frame::StreamEnd) | None => return Err(StreamError::Closed),
            }
        }
    }

    /// The next stanza element, skipping whitespace keep-alives and
    /// already-exchanged headers.
    pub async fn next_element(&mut self) -> Result<Element, StreamError> {
        loop {
            match self.next_frame().await? {
                Some(Frame::StanzaElement(element)) => return Ok(element),
                Some(Frame::Whitespace(_))
                | Some(Frame::Declaration)
                | Some(Frame::StreamStart(_)) => continue,
                Some(Frame::StreamEnd) => {
                    return Err(StreamError::Framing(FramingError::StreamClosedByPeer));
                }
                None => return Err(StreamError::Closed),
            }
        }
    }

    pub async fn next_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        match self.framed()?.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }

    pub async fn send_element(&mut self, element: Element) -> Result<(), StreamError> {
        debug!("send element <{}>", element.name());
        self.framed()?.send(WirePacket::Element(element)).await?;
        Ok(())
    }

    /// Sends the matching end token and schedules the socket shutdown after
    /// the grace window so the peer can drain the close.
    pub async fn close(&mut self) {
        let state = self.state;
        self.state = ChannelState::Closed;
        let Some(mut framed) = self.framed.take() else {
            return;
        };
        match state {
            ChannelState::Init => {
                let mut io = framed.into_parts().io;
                let _ = io.shutdown().await;
            }
            ChannelState::WsOpened | ChannelState::TcpOpened => {
                let framing = if state == ChannelState::WsOpened {
                    Framing::Open
                } else {
                    Framing::Stream
                };
                if let Err(err) = framed.send(WirePacket::CloseToken(framing)).await {
                    warn!("failed to send close token: {err}");
                }
                let mut io = framed.into_parts().io;
                let close_grace = self.close_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(close_grace).await;
                    let _ = io.shutdown().await;
                });
            }
            ChannelState::Closed => {}
        }
    }

    /// Restart unless a transport transition already reset the channel.
    pub fn reset_if_open(&mut self) {
        if self.state != ChannelState::Init {
            self.reset();
        }
    }

    /// Stream restart: a fresh codec over the same transport. Anything
    /// buffered but unprocessed is discarded.
    pub fn reset(&mut self) {
        if let Some(framed) = self.framed.take() {
            let io = framed.into_parts().io;
            self.framed = Some(Framed::new(io, XmlStreamCodec::new(self.max_stanza_size)));
        }
        self.state = ChannelState::Init;
    }

    /// STARTTLS transport upgrade followed by the implicit restart.
    pub async fn secure(&mut self) -> Result<(), StreamError> {
        let framed = self.framed.take().ok_or(StreamError::Closed)?;
        let io = framed.into_parts().io;
        let io = io.upgrade()?.await?;
        self.framed = Some(Framed::new(io, XmlStreamCodec::new(self.max_stanza_size)));
        self.state = ChannelState::Init;
        Ok(())
    }

    /// Installs a compression filter followed by the implicit restart.
    pub fn start_compress(&mut self, method: CompressionMethod) -> Result<(), StreamError> {
        let framed = self.framed.take().ok_or(StreamError::Closed)?;
        let mut io = framed.into_parts().io;
        io.start_compress(method)?;
        self.framed = Some(Framed::new(io, XmlStreamCodec::new(self.max_stanza_size)));
        self.state = ChannelState::Init;
        Ok(())
    }
}
