use anyhow::{Error, bail};

use palaver_core::xml::{Element, namespaces};
use palaver_core::xmpp::stream::{Channel, Connection};

use crate::sasl::failure_message;

/// Client side of STARTTLS: request, await `<proceed/>`, upgrade.
pub struct ClientTlsFeature {
    handled: bool,
}

impl ClientTlsFeature {
    pub fn new() -> Self {
        Self { handled: false }
    }

    pub fn handled(&self) -> bool {
        self.handled
    }

    pub fn matches(&self, advertisement: &Element) -> bool {
        !self.handled && advertisement.is_named("starttls")
    }

    pub async fn handle<C: Connection>(
        &mut self,
        _advertisement: &Element,
        channel: &mut Channel<C>,
    ) -> Result<bool, Error> {
        self.handled = true;

        channel
            .send_element(Element::new("starttls", Some(namespaces::XMPP_STARTTLS)))
            .await?;

        let reply = channel.next_element().await?;
        if !reply.validate("proceed", Some(namespaces::XMPP_STARTTLS)) {
            bail!("starttls refused: {}", failure_message(&reply));
        }

        channel.secure().await?;
        Ok(true)
    }
}

impl Default for ClientTlsFeature {
    fn default() -> Self {
        Self::new()
    }
}
