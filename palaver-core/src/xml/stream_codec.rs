use std::collections::VecDeque;

use bytes::BytesMut;
use rustyxml::{Event, Parser, StartTag};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use super::serializer::{XML_DECLARATION, XmlSerializer};
use super::{Element, namespaces};
use crate::xmpp::stream_header::{Framing, StreamHeader};

/// Per-stanza byte ceiling applied when none is configured.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 2 * 1024 * 1024;

const STREAM_NAME: &str = "stream";
const OPEN_NAME: &str = "open";

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("too large stanza")]
    TooLargeStanza,
    #[error("unexpected end element </{0}>")]
    UnexpectedEnd(String),
    #[error("no element: non-whitespace text between stanzas")]
    NoElement,
    #[error("stream closed by peer")]
    StreamClosedByPeer,
    #[error("malformed xml: {0}")]
    BadXml(String),
    #[error("input is not valid utf-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One stream-level event.
///
/// The open header is a standalone event rather than a balanced element:
/// XMPP nests all stanzas inside the unclosed stream root for the lifetime
/// of the stream.
#[derive(Debug)]
pub enum Frame {
    /// The `<?xml …?>` prolog, permitted only before the open header.
    Declaration,
    /// A `<stream:stream …>` or `<open …>` header.
    StreamStart(StreamHeader),
    /// A complete top-level stanza with all its descendants.
    StanzaElement(Element),
    /// Inter-stanza whitespace, valid as a keep-alive.
    Whitespace(String),
    /// The stream-level end token.
    StreamEnd,
}

/// Outbound wire item.
#[derive(Debug)]
pub enum WirePacket {
    Declaration,
    /// A stream header; its namespace declarations stay in scope for every
    /// element written afterwards.
    OpenHeader(Element),
    Element(Element),
    CloseToken(Framing),
}

/// Incremental framer for one XMPP stream, usable with
/// [`tokio_util::codec::Framed`].
///
/// Decoding drives the XML tokenizer over every byte read from the
/// transport and accounts the distance from the last completed top-level
/// frame; a stanza that would grow past `max_stanza_size` aborts the stream
/// before the element materializes.
pub struct XmlStreamCodec {
    parser: Parser,
    serializer: XmlSerializer,
    stack: Vec<Element>,
    frames: VecDeque<Frame>,
    max_stanza_size: usize,
    offset: usize,
    mark: usize,
    carry: Vec<u8>,
    in_markup: bool,
    header_seen: bool,
    just_opened: bool,
}

impl XmlStreamCodec {
    pub fn new(max_stanza_size: usize) -> Self {
        Self {
            parser: Parser::new(),
            serializer: XmlSerializer::new(),
            stack: Vec::new(),
            frames: VecDeque::new(),
            max_stanza_size,
            offset: 0,
            mark: 0,
            carry: Vec::new(),
            in_markup: false,
            header_seen: false,
            just_opened: false,
        }
    }

    fn feed(&mut self, text: &str) -> Result<(), FramingError> {
        let mut buf = [0u8; 4];
        for ch in text.chars() {
            self.parser.feed_str(ch.encode_utf8(&mut buf));
            self.offset += ch.len_utf8();

            if ch == '<' {
                self.in_markup = true;
            } else if ch == '>' {
                self.in_markup = false;
            }

            if self.stack.is_empty() && !self.in_markup && ch.is_ascii_whitespace() {
                // Stream-level whitespace never counts against the next
                // stanza's budget.
                self.mark = self.offset;
            } else if self.max_stanza_size > 0 && self.offset - self.mark > self.max_stanza_size {
                return Err(FramingError::TooLargeStanza);
            }

            while let Some(event) = (&mut self.parser).next() {
                let event = event.map_err(|err| FramingError::BadXml(err.to_string()))?;
                self.handle_event(event)?;
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Event) -> Result<(), FramingError> {
        match event {
            Event::PI(text) => {
                self.just_opened = false;
                if !self.stack.is_empty() || self.header_seen {
                    return Err(FramingError::NoElement);
                }
                trace!("RECV declaration: <?{text}?>");
                self.complete(Frame::Declaration);
            }
            Event::ElementStart(tag) => {
                self.just_opened = false;
                if self.stack.is_empty()
                    && (tag.name == STREAM_NAME || tag.name == OPEN_NAME)
                {
                    let header = header_from_tag(&tag);
                    debug!("RECV header: {header:?}");
                    self.header_seen = true;
                    self.just_opened = true;
                    self.complete(Frame::StreamStart(header));
                } else {
                    self.stack.push(element_from_tag(tag));
                }
            }
            Event::ElementEnd(tag) => {
                let Some(element) = self.stack.pop() else {
                    if tag.name == STREAM_NAME || tag.name == OPEN_NAME {
                        // A self-closed `<open/>` header produces a paired
                        // end event out of the same input byte; that is
                        // part of the header, not a close token.
                        if self.just_opened && self.offset == self.mark {
                            self.just_opened = false;
                            return Ok(());
                        }
                        debug!("RECV close token: </{}>", tag.name);
                        self.complete(Frame::StreamEnd);
                        return Ok(());
                    }
                    return Err(FramingError::UnexpectedEnd(tag.name));
                };
                self.just_opened = false;
                if element.name != tag.name {
                    return Err(FramingError::UnexpectedEnd(tag.name));
                }
                match self.stack.last_mut() {
                    Some(parent) => parent.add_child(element),
                    None => {
                        debug!("RECV element: <{}/> …", element.name);
                        self.complete(Frame::StanzaElement(element));
                    }
                }
            }
            Event::Characters(text) | Event::CDATA(text) => {
                self.just_opened = false;
                match self.stack.last_mut() {
                    Some(top) => top.add_text(text),
                    None => {
                        if !text.chars().all(|ch| ch.is_ascii_whitespace()) {
                            return Err(FramingError::NoElement);
                        }
                        self.complete(Frame::Whitespace(text));
                    }
                }
            }
            Event::Comment(_) => {}
        }
        Ok(())
    }

    fn complete(&mut self, frame: Frame) {
        self.mark = self.offset;
        if let Frame::Whitespace(new_text) = &frame {
            if let Some(Frame::Whitespace(existing)) = self.frames.back_mut() {
                existing.push_str(new_text);
                return;
            }
        }
        self.frames.push_back(frame);
    }
}

impl Default for XmlStreamCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STANZA_SIZE)
    }
}

impl Decoder for XmlStreamCodec {
    type Item = Frame;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FramingError> {
        if !src.is_empty() {
            self.carry.extend_from_slice(&src.split_to(src.len()));
            let (valid, rest) = match std::str::from_utf8(&self.carry) {
                Ok(text) => (text.to_string(), Vec::new()),
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    // A partial code point at the chunk edge is carried to
                    // the next read; anything longer is garbage.
                    if self.carry.len() - valid_up_to > 3 || err.error_len().is_some() {
                        return Err(FramingError::InvalidUtf8);
                    }
                    let text = std::str::from_utf8(&self.carry[..valid_up_to])
                        .expect("validated prefix")
                        .to_string();
                    (text, self.carry[valid_up_to..].to_vec())
                }
            };
            self.carry = rest;
            self.feed(&valid)?;
        }

        Ok(self.frames.pop_front())
    }
}

impl Encoder<WirePacket> for XmlStreamCodec {
    type Error = FramingError;

    fn encode(&mut self, item: WirePacket, dst: &mut BytesMut) -> Result<(), FramingError> {
        let text = match item {
            WirePacket::Declaration => XML_DECLARATION.to_string(),
            WirePacket::OpenHeader(element) => self.serializer.opening_tag(&element),
            WirePacket::Element(element) => self.serializer.element(&element),
            WirePacket::CloseToken(Framing::Stream) => "</stream:stream>".to_string(),
            WirePacket::CloseToken(Framing::Open) => "</open>".to_string(),
        };
        debug!("SEND: {text}");
        dst.extend_from_slice(text.as_bytes());
        Ok(())
    }
}

fn header_from_tag(tag: &StartTag) -> StreamHeader {
    let attr = |name: &str| {
        tag.attributes
            .get(&(name.to_string(), None))
            .map(|value| value.to_string())
    };

    StreamHeader {
        framing: if tag.name == OPEN_NAME {
            Framing::Open
        } else {
            Framing::Stream
        },
        from: attr("from"),
        to: attr("to"),
        id: attr("id"),
        version: attr("version"),
        lang: tag
            .attributes
            .get(&("lang".to_string(), Some(namespaces::XML.to_string())))
            .map(|value| value.to_string()),
        default_namespace: attr("xmlns"),
    }
}

fn element_from_tag(tag: StartTag) -> Element {
    let mut element = Element::new(&tag.name, tag.ns.as_deref());
    for ((name, namespace), value) in tag.attributes {
        element.set_attribute(&name, namespace.as_deref(), value);
    }
    element
}
