use anyhow::{Error, bail};

use palaver_core::xml::{Element, namespaces};
use palaver_core::xmpp::stream::{Channel, Connection};

/// The STARTTLS stream feature: `<proceed/>`, then the in-band transport
/// upgrade. The part restarts the stream afterwards.
pub struct TlsFeature {
    mandatory: bool,
    handled: bool,
}

impl TlsFeature {
    pub fn new(mandatory: bool) -> Self {
        Self {
            mandatory,
            handled: false,
        }
    }

    pub fn mandatory(&self) -> bool {
        self.mandatory
    }

    pub fn handled(&self) -> bool {
        self.handled
    }

    pub fn advertisement(&self) -> Element {
        let mut starttls = Element::new("starttls", Some(namespaces::XMPP_STARTTLS));
        if self.mandatory {
            starttls.add_child(Element::new("required", Some(namespaces::XMPP_STARTTLS)));
        }
        starttls
    }

    pub fn matches(&self, element: &Element) -> bool {
        element.validate("starttls", Some(namespaces::XMPP_STARTTLS))
    }

    pub async fn handle<C: Connection>(
        &mut self,
        _element: &Element,
        channel: &mut Channel<C>,
    ) -> Result<(), Error> {
        self.handled = true;

        if !channel.starttls_available() {
            // Unlike SASL failures, the TLS failure element carries no
            // condition child.
            channel
                .send_element(Element::new("failure", Some(namespaces::XMPP_STARTTLS)))
                .await?;
            bail!("starttls requested but no tls material is configured");
        }

        channel
            .send_element(Element::new("proceed", Some(namespaces::XMPP_STARTTLS)))
            .await?;
        channel.secure().await?;
        Ok(())
    }
}
