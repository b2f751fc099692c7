use std::fmt::{Display, Formatter};

use base64::prelude::*;
use rand::{RngCore, SeedableRng};

use crate::xml::{Element, namespaces};
use crate::xmpp::jid::Jid;
use crate::xmpp::stream::StreamError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamId(String);

impl StreamId {
    pub fn new() -> Self {
        let mut rng = rand_chacha::ChaCha20Rng::from_entropy();
        let mut id_raw = [0u8; 16];
        rng.fill_bytes(&mut id_raw);
        Self(BASE64_STANDARD.encode(id_raw))
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageTag(pub String);

impl Display for LanguageTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the stream root is framed on the wire: the classic TCP
/// `<stream:stream>` root or the WebSocket sub-protocol `<open/>` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Stream,
    Open,
}

/// The raw attributes of an inbound stream header, before validation.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    pub framing: Framing,
    pub from: Option<String>,
    pub to: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
    pub default_namespace: Option<String>,
}

/// Per-stream negotiated state.
///
/// The header exchange fills in framing, language and the peer identity;
/// SASL later sets the username and bind the resource. Stream-restarting
/// features reset the transport and framer but never this state.
#[derive(Debug, Clone)]
pub struct PartAttr {
    pub jid: Option<Jid>,
    pub domain: String,
    pub stream_id: Option<StreamId>,
    pub version: String,
    pub lang: Option<LanguageTag>,
    pub default_namespace: String,
    pub framing: Framing,
}

impl PartAttr {
    pub fn new(domain: &str) -> Self {
        Self {
            jid: None,
            domain: domain.to_string(),
            stream_id: None,
            version: "1.0".to_string(),
            lang: None,
            default_namespace: namespaces::XMPP_CLIENT.to_string(),
            framing: Framing::Stream,
        }
    }

    /// Absorbs a header received by the server side and validates it
    /// against the local domain.
    pub fn read_client_header(&mut self, header: &StreamHeader) -> Result<(), StreamError> {
        self.framing = header.framing;
        match header.to.as_deref() {
            Some(to) if to == self.domain => {}
            _ => return Err(StreamError::NotForThisDomain),
        }
        if let Some(from) = &header.from {
            let jid: Jid = from.parse().map_err(|_| StreamError::ImproperFromAttr)?;
            // A SASL-established identity survives stream restarts; the
            // header cannot re-assign it.
            if self.jid.is_none() {
                self.jid = Some(jid);
            }
        }
        if let Some(version) = &header.version {
            self.version = version.clone();
        }
        if let Some(lang) = &header.lang {
            self.lang = Some(LanguageTag(lang.clone()));
        }
        if let Some(ns) = &header.default_namespace {
            self.default_namespace = ns.clone();
        }
        Ok(())
    }

    /// Absorbs a header received by the client side; the id is the one the
    /// server assigned at accept.
    pub fn read_server_header(&mut self, header: &StreamHeader) -> Result<(), StreamError> {
        self.framing = header.framing;
        if let Some(from) = &header.from {
            if from != &self.domain {
                return Err(StreamError::NotForThisDomain);
            }
        }
        if let Some(id) = &header.id {
            self.stream_id = Some(StreamId::from(id.clone()));
        }
        if let Some(version) = &header.version {
            self.version = version.clone();
        }
        if let Some(lang) = &header.lang {
            self.lang = Some(LanguageTag(lang.clone()));
        }
        Ok(())
    }

    /// The header a server sends towards the client.
    pub fn to_client_header(&self) -> Element {
        let mut header = self.header_element();
        header.set_attribute("from", None, self.domain.clone());
        if let Some(id) = &self.stream_id {
            header.set_attribute("id", None, id.to_string());
        }
        if let Some(jid) = &self.jid {
            header.set_attribute("to", None, jid.to_string());
        }
        self.finish_header(header)
    }

    /// The header a client sends towards the server.
    pub fn to_server_header(&self) -> Element {
        let mut header = self.header_element();
        if let Some(jid) = &self.jid {
            header.set_attribute("from", None, jid.to_string());
        }
        header.set_attribute("to", None, self.domain.clone());
        self.finish_header(header)
    }

    fn header_element(&self) -> Element {
        match self.framing {
            Framing::Stream => Element::new("stream", Some(namespaces::XMPP_STREAMS)),
            Framing::Open => Element::new("open", Some(namespaces::XMPP_FRAMING)),
        }
    }

    fn finish_header(&self, mut header: Element) -> Element {
        header.set_attribute("version", None, self.version.clone());
        if let Some(lang) = &self.lang {
            header.set_attribute("lang", Some(namespaces::XML), lang.to_string());
        }
        if self.framing == Framing::Stream {
            header.set_attribute("xmlns", None, self.default_namespace.clone());
            header.set_attribute("stream", Some(namespaces::XMLNS), namespaces::XMPP_STREAMS);
        }
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound_header() -> StreamHeader {
        StreamHeader {
            framing: Framing::Stream,
            from: Some("test@x.im".to_string()),
            to: Some("x.im".to_string()),
            id: None,
            version: Some("1.0".to_string()),
            lang: Some("en".to_string()),
            default_namespace: Some(namespaces::XMPP_CLIENT.to_string()),
        }
    }

    #[test]
    fn server_accepts_matching_domain() {
        let mut attr = PartAttr::new("x.im");
        attr.read_client_header(&inbound_header()).unwrap();
        assert_eq!(attr.jid.as_ref().unwrap().to_string(), "test@x.im");
        assert_eq!(attr.lang.as_ref().unwrap().to_string(), "en");
    }

    #[test]
    fn server_rejects_foreign_domain() {
        let mut attr = PartAttr::new("y.im");
        assert!(matches!(
            attr.read_client_header(&inbound_header()),
            Err(StreamError::NotForThisDomain)
        ));
    }

    #[test]
    fn server_rejects_malformed_from() {
        let mut attr = PartAttr::new("x.im");
        let mut header = inbound_header();
        header.from = Some("@x.im".to_string());
        assert!(matches!(
            attr.read_client_header(&header),
            Err(StreamError::ImproperFromAttr)
        ));
    }

    #[test]
    fn client_absorbs_assigned_stream_id() {
        let mut attr = PartAttr::new("x.im");
        let header = StreamHeader {
            framing: Framing::Stream,
            from: Some("x.im".to_string()),
            to: None,
            id: Some("abc123".to_string()),
            version: Some("1.0".to_string()),
            lang: None,
            default_namespace: None,
        };
        attr.read_server_header(&header).unwrap();
        assert_eq!(attr.stream_id.as_ref().unwrap().to_string(), "abc123");
    }

    #[test]
    fn stream_ids_are_unique() {
        assert_ne!(StreamId::new(), StreamId::new());
    }
}
