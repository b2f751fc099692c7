use base64::prelude::*;
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use anyhow::{Error, bail};
use palaver_core::xml::{Element, namespaces};
use palaver_core::xmpp::jid::Jid;
use palaver_core::xmpp::stanza::Failure;
use palaver_core::xmpp::stream::{Channel, Connection};
use palaver_core::xmpp::stream_header::PartAttr;

use self::scram::ScramToAuth;

pub mod scram;

/// Client side of one SASL mechanism.
pub enum ToAuth {
    Plain(PlainToAuth),
    ScramSha1(ScramToAuth<Sha1>),
    ScramSha256(ScramToAuth<Sha256>),
    ScramSha512(ScramToAuth<Sha512>),
}

impl ToAuth {
    pub fn plain(username: &str, password: &str) -> Self {
        ToAuth::Plain(PlainToAuth {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn scram_sha1(username: &str, password: &str, channel_binding: bool) -> Self {
        ToAuth::ScramSha1(ScramToAuth::new(username, password, channel_binding))
    }

    pub fn scram_sha256(username: &str, password: &str, channel_binding: bool) -> Self {
        ToAuth::ScramSha256(ScramToAuth::new(username, password, channel_binding))
    }

    pub fn scram_sha512(username: &str, password: &str, channel_binding: bool) -> Self {
        ToAuth::ScramSha512(ScramToAuth::new(username, password, channel_binding))
    }

    fn username(&self) -> &str {
        match self {
            ToAuth::Plain(auth) => &auth.username,
            ToAuth::ScramSha1(auth) => auth.username(),
            ToAuth::ScramSha256(auth) => auth.username(),
            ToAuth::ScramSha512(auth) => auth.username(),
        }
    }

    async fn authenticate<C: Connection>(
        &self,
        mechanism: &str,
        channel: &mut Channel<C>,
    ) -> Result<(), Error> {
        match self {
            ToAuth::Plain(auth) => auth.authenticate(mechanism, channel).await,
            ToAuth::ScramSha1(auth) => auth.authenticate(mechanism, channel).await,
            ToAuth::ScramSha256(auth) => auth.authenticate(mechanism, channel).await,
            ToAuth::ScramSha512(auth) => auth.authenticate(mechanism, channel).await,
        }
    }
}

/// RFC 4616 PLAIN from the client side: a single message, then success or
/// failure.
pub struct PlainToAuth {
    username: String,
    password: String,
}

impl PlainToAuth {
    async fn authenticate<C: Connection>(
        &self,
        mechanism: &str,
        channel: &mut Channel<C>,
    ) -> Result<(), Error> {
        let payload = format!("\0{}\0{}", self.username, self.password);
        let mut auth = Element::new("auth", Some(namespaces::XMPP_SASL));
        auth.set_attribute("mechanism", None, mechanism);
        auth.add_text(BASE64_STANDARD.encode(payload));
        channel.send_element(auth).await?;

        let reply = channel.next_element().await?;
        if reply.validate("success", Some(namespaces::XMPP_SASL)) {
            return Ok(());
        }
        bail!(failure_message(&reply));
    }
}

/// The SASL feature from the client side: picks the first registered
/// mechanism the server offers, in registration order.
pub struct ClientSaslFeature {
    supports: Vec<(String, ToAuth)>,
    handled: bool,
}

impl ClientSaslFeature {
    pub fn new() -> Self {
        Self {
            supports: Vec::new(),
            handled: false,
        }
    }

    pub fn support(&mut self, name: &str, auth: ToAuth) -> &mut Self {
        self.supports.push((name.to_string(), auth));
        self
    }

    pub fn handled(&self) -> bool {
        self.handled
    }

    pub fn matches(&self, advertisement: &Element) -> bool {
        !self.handled && advertisement.is_named("mechanisms")
    }

    /// Returns true: successful authentication always restarts the stream.
    pub async fn handle<C: Connection>(
        &mut self,
        advertisement: &Element,
        attr: &mut PartAttr,
        channel: &mut Channel<C>,
    ) -> Result<bool, Error> {
        let offered: Vec<String> = advertisement
            .child_elements()
            .filter(|child| child.is_named("mechanism"))
            .map(|child| child.text())
            .collect();

        for (name, auth) in &self.supports {
            if !offered.iter().any(|offer| offer == name) {
                continue;
            }
            auth.authenticate(name, channel).await?;
            self.handled = true;
            attr.jid = Some(Jid::new(Some(auth.username()), &attr.domain, None));
            return Ok(true);
        }

        bail!(
            "no common mechanism: server offers [{}]",
            offered.join(",")
        );
    }
}

impl Default for ClientSaslFeature {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn failure_message(element: &Element) -> String {
    match Failure::from_element(element, namespaces::XMPP_SASL) {
        Ok(failure) => match failure.text {
            Some(text) => format!("{}: {}", failure.condition, text),
            None => failure.condition,
        },
        Err(_) => format!("unexpected element <{}>", element.name()),
    }
}
