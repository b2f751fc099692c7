use anyhow::{Error, bail};
use tokio::select;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, info, warn};

use palaver_core::xml::stream_codec::Frame;
use palaver_core::xml::Element;
use palaver_core::xmpp::jid::Jid;
use palaver_core::xmpp::part::{ElemHandler, ElemHandlers, PartContext, SessionHandle};
use palaver_core::xmpp::stream::{Channel, Connection};
use palaver_core::xmpp::stream_header::PartAttr;

use self::bind::ClientBindFeature;
use self::compress::ClientCompressFeature;
use self::sasl::ClientSaslFeature;
use self::starttls::ClientTlsFeature;

pub mod bind;
pub mod compress;
pub mod connection;
pub mod sasl;
pub mod starttls;

const STANZA_QUEUE_SIZE: usize = 8;

/// One negotiation step on the client side, each a mirror of a server
/// feature.
pub enum ClientFeature {
    Tls(ClientTlsFeature),
    Sasl(ClientSaslFeature),
    Bind(ClientBindFeature),
    Compress(ClientCompressFeature),
}

impl ClientFeature {
    fn matches(&self, advertisement: &Element) -> bool {
        match self {
            ClientFeature::Tls(feature) => feature.matches(advertisement),
            ClientFeature::Sasl(feature) => feature.matches(advertisement),
            ClientFeature::Bind(feature) => feature.matches(advertisement),
            ClientFeature::Compress(feature) => feature.matches(advertisement),
        }
    }

    /// Runs the exchange; true means the stream must be reopened.
    async fn handle<C: Connection>(
        &mut self,
        advertisement: &Element,
        attr: &mut PartAttr,
        channel: &mut Channel<C>,
    ) -> Result<bool, Error> {
        match self {
            ClientFeature::Tls(feature) => feature.handle(advertisement, channel).await,
            ClientFeature::Sasl(feature) => feature.handle(advertisement, attr, channel).await,
            ClientFeature::Bind(feature) => feature.handle(advertisement, attr, channel).await,
            ClientFeature::Compress(feature) => feature.handle(advertisement, channel).await,
        }
    }
}

/// Asks a running client part to shut its stream down.
#[derive(Clone)]
pub struct StopHandle {
    tx: Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.try_send(());
    }
}

/// The client side of one XMPP stream: opens towards the server, walks
/// the advertised feature batches by priority, then exchanges stanzas.
pub struct ClientPart<C: Connection> {
    attr: PartAttr,
    channel: Channel<C>,
    features: Vec<ClientFeature>,
    handlers: ElemHandlers<C>,
    session: SessionHandle,
    outbound_rx: Receiver<Element>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl<C: Connection> ClientPart<C> {
    pub fn new(connection: C, jid: Jid, max_stanza_size: usize) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(STANZA_QUEUE_SIZE);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let mut attr = PartAttr::new(jid.domain());
        attr.jid = Some(jid);
        Self {
            attr,
            channel: Channel::new(connection, false, max_stanza_size),
            features: Vec::new(),
            handlers: ElemHandlers::new(),
            session: SessionHandle::new(outbound_tx),
            outbound_rx,
            stop_tx,
            stop_rx,
        }
    }

    pub fn with_feature(&mut self, feature: ClientFeature) -> &mut Self {
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

    pub async fn run(&mut self) -> Result<(), Error> {
        self.negotiate().await?;
        info!(jid = %display_jid(&self.attr), "stream negotiated");
        self.run_stanzas().await
    }

    async fn negotiate(&mut self) -> Result<(), Error> {
        'restart: loop {
            self.channel.open(&self.attr).await?;
            self.channel.wait_header(&mut self.attr).await?;

            let features_elem = self.channel.next_element().await?;
            if !features_elem.is_named("features") {
                bail!(
                    "expected stream features, got <{}>",
                    features_elem.name()
                );
            }
            let advertised: Vec<&Element> = features_elem.child_elements().collect();
            if advertised.is_empty() {
                return Ok(());
            }

            // starttls > mechanisms > bind > others; the stable sort keeps
            // advertisement order within a priority class.
            let mut order: Vec<usize> = (0..advertised.len()).collect();
            order.sort_by_key(|&index| priority(advertised[index].name()));

            for &index in &order {
                let advertisement = advertised[index];
                let Some(feature_index) = self
                    .features
                    .iter()
                    .position(|feature| feature.matches(advertisement))
                else {
                    if is_required(advertisement) {
                        bail!(
                            "server requires <{}> which we do not support",
                            advertisement.name()
                        );
                    }
                    debug!("skipping unsupported feature <{}>", advertisement.name());
                    continue;
                };

                let feature = &mut self.features[feature_index];
                let restart = feature
                    .handle(advertisement, &mut self.attr, &mut self.channel)
                    .await?;
                if restart {
                    self.channel.reset_if_open();
                    continue 'restart;
                }
            }

            return Ok(());
        }
    }

    async fn run_stanzas(&mut self) -> Result<(), Error> {
        loop {
            select! {
                frame = self.channel.next_frame() => {
                    match frame? {
                        Some(Frame::StanzaElement(element)) => {
                            self.dispatch(element).await;
                        }
                        Some(Frame::Whitespace(_))
                        | Some(Frame::Declaration)
                        | Some(Frame::StreamStart(_)) => {}
                        Some(Frame::StreamEnd) | None => {
                            self.channel.close().await;
                            return Ok(());
                        }
                    }
                }
                Some(element) = self.outbound_rx.recv() => {
                    self.channel.send_element(element).await?;
                }
                Some(()) = self.stop_rx.recv() => {
                    self.channel.close().await;
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&mut self, element: Element) {
        let ClientPart {
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
                return;
            }
        }
        debug!("dropping unhandled element <{}>", element.name());
    }
}

fn priority(name: &str) -> u8 {
    match name {
        "starttls" => 0,
        "mechanisms" => 1,
        "bind" => 2,
        _ => 3,
    }
}

fn is_required(advertisement: &Element) -> bool {
    // SASL carries no <required/> marker; the protocol cannot proceed
    // without it regardless.
    advertisement.is_named("mechanisms")
        || advertisement.find_child_named("required").is_some()
}

fn display_jid(attr: &PartAttr) -> String {
    attr.jid
        .as_ref()
        .map(|jid| jid.to_string())
        .unwrap_or_else(|| "<anonymous>".to_string())
}
