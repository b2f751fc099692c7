use std::time::Duration;

use anyhow::Error;
use tokio::select;
use tokio::sync::mpsc::{self, Receiver};
use tracing::{debug, info, warn};

use palaver_core::xml::stream_codec::{Frame, FramingError};
use palaver_core::xml::{Element, namespaces};
use palaver_core::xmpp::part::{ElemHandler, ElemHandlers, PartContext, SessionHandle};
use palaver_core::xmpp::stream::{Channel, Connection, StreamError};
use palaver_core::xmpp::stream_header::{PartAttr, StreamId};

use self::bind::BindFeature;
use self::compress::CompressFeature;
use self::sasl::SaslFeature;
use self::starttls::TlsFeature;

pub mod bind;
pub mod c2s;
pub mod compress;
pub mod connection;
pub mod s2s;
pub mod sasl;
pub mod starttls;

const STANZA_QUEUE_SIZE: usize = 8;

#[derive(Debug, thiserror::Error)]
#[error("unexpected feature element <{0}>")]
pub struct UnexpectedFeatureElement(pub String);

/// Asks a running server part to shut its stream down.
#[derive(Clone)]
pub struct StopHandle {
    tx: mpsc::Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.try_send(());
    }
}

/// A mandatory feature ran and failed; the wire-level failure element has
/// already been sent, so the stream just closes.
#[derive(Debug, thiserror::Error)]
#[error("feature `{name}` failed")]
struct FeatureFailed {
    name: &'static str,
    #[source]
    cause: Error,
}

/// One negotiation step on the server side. The set is a closed tagged
/// variant; each value is single-use per stream.
pub enum ServerFeature {
    Tls(TlsFeature),
    Sasl(SaslFeature),
    Bind(BindFeature),
    Compress(CompressFeature),
}

impl ServerFeature {
    fn name(&self) -> &'static str {
        match self {
            ServerFeature::Tls(_) => "starttls",
            ServerFeature::Sasl(_) => "sasl",
            ServerFeature::Bind(_) => "bind",
            ServerFeature::Compress(_) => "compression",
        }
    }

    fn advertisement(&self) -> Element {
        match self {
            ServerFeature::Tls(feature) => feature.advertisement(),
            ServerFeature::Sasl(feature) => feature.advertisement(),
            ServerFeature::Bind(feature) => feature.advertisement(),
            ServerFeature::Compress(feature) => feature.advertisement(),
        }
    }

    fn mandatory(&self) -> bool {
        match self {
            ServerFeature::Tls(feature) => feature.mandatory(),
            ServerFeature::Sasl(_) => true,
            ServerFeature::Bind(feature) => feature.mandatory(),
            ServerFeature::Compress(_) => false,
        }
    }

    fn handled(&self) -> bool {
        match self {
            ServerFeature::Tls(feature) => feature.handled(),
            ServerFeature::Sasl(feature) => feature.handled(),
            ServerFeature::Bind(feature) => feature.handled(),
            ServerFeature::Compress(feature) => feature.handled(),
        }
    }

    /// STARTTLS, successful SASL and compression invalidate the stream
    /// state; binding does not.
    fn requires_restart(&self) -> bool {
        matches!(
            self,
            ServerFeature::Tls(_) | ServerFeature::Sasl(_) | ServerFeature::Compress(_)
        )
    }

    fn matches(&self, element: &Element) -> bool {
        match self {
            ServerFeature::Tls(feature) => feature.matches(element),
            ServerFeature::Sasl(feature) => feature.matches(element),
            ServerFeature::Bind(feature) => feature.matches(element),
            ServerFeature::Compress(feature) => feature.matches(element),
        }
    }

    async fn handle<C: Connection>(
        &mut self,
        element: &Element,
        attr: &mut PartAttr,
        channel: &mut Channel<C>,
        session: &SessionHandle,
    ) -> Result<(), Error> {
        match self {
            ServerFeature::Tls(feature) => feature.handle(element, channel).await,
            ServerFeature::Sasl(feature) => feature.handle(element, attr, channel, session).await,
            ServerFeature::Bind(feature) => feature.handle(element, attr, channel, session).await,
            ServerFeature::Compress(feature) => feature.handle(element, channel).await,
        }
    }
}

enum Flow {
    Restart,
    Running,
    Closed,
}

/// The server side of one XMPP stream: drives the RFC 6120 negotiation
/// flowchart over the channel, then routes stanzas until the stream ends.
///
/// Everything is strictly sequential: one event is pulled, fully
/// dispatched, then the next one.
pub struct ServerPart<C: Connection> {
    attr: PartAttr,
    channel: Channel<C>,
    features: Vec<ServerFeature>,
    handlers: ElemHandlers<C>,
    session: SessionHandle,
    outbound_rx: Receiver<Element>,
    stop_tx: mpsc::Sender<()>,
    stop_rx: Receiver<()>,
}

impl<C: Connection> ServerPart<C> {
    pub fn new(connection: C, domain: &str, max_stanza_size: usize) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(STANZA_QUEUE_SIZE);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Self {
            attr: PartAttr::new(domain),
            channel: Channel::new(connection, true, max_stanza_size),
            features: Vec::new(),
            handlers: ElemHandlers::new(),
            session: SessionHandle::new(outbound_tx),
            outbound_rx,
            stop_tx,
            stop_rx,
        }
    }

    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.channel = self.channel.with_close_grace(close_grace);
        self
    }

    pub fn with_feature(&mut self, feature: ServerFeature) -> &mut Self {
        self.features.push(feature);
        self
    }

    pub fn with_elem_handler(&mut self, handler: Box<dyn ElemHandler<C>>) -> &mut Self {
        self.handlers.add(handler);
        self
    }

    pub fn attr(&self) -> &PartAttr {
        &self.attr
    }

    pub fn attr_mut(&mut self) -> &mut PartAttr {
        &mut self.attr
    }

    pub fn session_handle(&self) -> SessionHandle {
        self.session.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Runs the stream to completion, reporting failures to the peer
    /// before closing.
    pub async fn handle(&mut self) {
        if let Err(error) = self.run().await {
            warn!("stream failed: {error:#}");
            if let Some(condition) = stream_error_condition(&error) {
                let mut stream_error = Element::new("error", Some(namespaces::XMPP_STREAMS));
                stream_error.add_child(Element::new(
                    condition,
                    Some(namespaces::XMPP_STREAM_ERRORS),
                ));
                let _ = self.channel.send_element(stream_error).await;
            }
            self.channel.close().await;
        }
    }

    pub async fn run(&mut self) -> Result<(), Error> {
        loop {
            self.channel.wait_header(&mut self.attr).await?;
            self.attr.stream_id = Some(StreamId::new());
            self.channel.open(&self.attr).await?;

            match self.negotiate().await? {
                Flow::Restart => continue,
                Flow::Closed => return Ok(()),
                Flow::Running => {}
            }

            info!(jid = %display_jid(&self.attr), "stream negotiated");
            match self.run_stanzas().await? {
                Flow::Restart => continue,
                Flow::Running => unreachable!("stanza loop never yields Running"),
                Flow::Closed => return Ok(()),
            }
        }
    }

    async fn negotiate(&mut self) -> Result<Flow, Error> {
        loop {
            self.advertise_features().await?;
            let mandatory_pending = self
                .features
                .iter()
                .any(|feature| !feature.handled() && feature.mandatory());
            if !mandatory_pending {
                return Ok(Flow::Running);
            }

            let element = self.channel.next_element().await?;
            let Some(index) = self
                .features
                .iter()
                .position(|feature| !feature.handled() && feature.matches(&element))
            else {
                return Err(UnexpectedFeatureElement(element.name().to_string()).into());
            };
            if let Some(flow) = self.run_feature(index, &element).await? {
                return Ok(flow);
            }
        }
    }

    /// Advertises pending features in registration order, stopping at the
    /// first pending mandatory one: it gates everything behind it.
    async fn advertise_features(&mut self) -> Result<(), Error> {
        let mut features = Element::new("features", Some(namespaces::XMPP_STREAMS));
        for feature in &self.features {
            if feature.handled() {
                continue;
            }
            features.add_child(feature.advertisement());
            if feature.mandatory() {
                break;
            }
        }
        self.channel.send_element(features).await?;
        Ok(())
    }

    async fn run_feature(
        &mut self,
        index: usize,
        element: &Element,
    ) -> Result<Option<Flow>, Error> {
        let name = self.features[index].name();
        let mandatory = self.features[index].mandatory();
        debug!("running feature {name}");

        let feature = &mut self.features[index];
        let result = feature
            .handle(element, &mut self.attr, &mut self.channel, &self.session)
            .await;

        match result {
            Ok(()) => {
                if self.features[index].requires_restart() {
                    self.channel.reset_if_open();
                    Ok(Some(Flow::Restart))
                } else {
                    Ok(None)
                }
            }
            Err(cause) => {
                if mandatory {
                    Err(FeatureFailed { name, cause }.into())
                } else {
                    warn!("optional feature {name} failed: {cause:#}");
                    Ok(None)
                }
            }
        }
    }

    async fn run_stanzas(&mut self) -> Result<Flow, Error> {
        loop {
            select! {
                frame = self.channel.next_frame() => {
                    match frame? {
                        Some(Frame::StanzaElement(element)) => {
                            if let Some(flow) = self.dispatch(element).await? {
                                return Ok(flow);
                            }
                        }
                        Some(Frame::Whitespace(_))
                        | Some(Frame::Declaration)
                        | Some(Frame::StreamStart(_)) => {}
                        Some(Frame::StreamEnd) | None => {
                            self.channel.close().await;
                            return Ok(Flow::Closed);
                        }
                    }
                }
                Some(element) = self.outbound_rx.recv() => {
                    self.channel.send_element(element).await?;
                }
                Some(()) = self.stop_rx.recv() => {
                    self.channel.close().await;
                    return Ok(Flow::Closed);
                }
            }
        }
    }

    async fn dispatch(&mut self, element: Element) -> Result<Option<Flow>, Error> {
        // Optional features negotiate during the stanza phase; they take
        // precedence over application handlers.
        if let Some(index) = self
            .features
            .iter()
            .position(|feature| !feature.handled() && feature.matches(&element))
        {
            return self.run_feature(index, &element).await;
        }

        let ServerPart {
            handlers,
            attr,
            channel,
            ..
        } = self;
        for handler in handlers.iter_mut() {
            if handler.matches(&element) {
                let mut ctx = PartContext {
                    attr: &mut *attr,
                    channel: &mut *channel,
                };
                if let Err(err) = handler.handle(&element, &mut ctx).await {
                    warn!("element handler `{}` failed: {err:#}", handler.id());
                }
                return Ok(None);
            }
        }

        debug!("dropping unhandled element <{}>", element.name());
        Ok(None)
    }
}

fn display_jid(attr: &PartAttr) -> String {
    attr.jid
        .as_ref()
        .map(|jid| jid.to_string())
        .unwrap_or_else(|| "<anonymous>".to_string())
}

fn stream_error_condition(error: &Error) -> Option<&'static str> {
    if error.downcast_ref::<FeatureFailed>().is_some() {
        // The feature already put its failure on the wire.
        return None;
    }
    if error.downcast_ref::<UnexpectedFeatureElement>().is_some() {
        return Some("not-authorized");
    }
    if let Some(stream_error) = error.downcast_ref::<StreamError>() {
        return match stream_error {
            StreamError::Closed | StreamError::Io(_) | StreamError::Connection(_) => None,
            StreamError::NotForThisDomain => Some("host-unknown"),
            StreamError::ImproperFromAttr | StreamError::Jid(_) => Some("invalid-from"),
            StreamError::NotHeaderStart => Some("bad-format"),
            StreamError::Framing(FramingError::TooLargeStanza) => Some("policy-violation"),
            StreamError::Framing(FramingError::StreamClosedByPeer) => None,
            StreamError::Framing(_) => Some("not-well-formed"),
        };
    }
    Some("internal-server-error")
}
