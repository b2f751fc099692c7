use anyhow::{Error, bail};
use uuid::Uuid;

use palaver_core::xml::{Element, namespaces};
use palaver_core::xmpp::jid::Jid;
use palaver_core::xmpp::stanza::{IqType, Stanza, StanzaErrorElem, StanzaName};
use palaver_core::xmpp::stream::{Channel, Connection};
use palaver_core::xmpp::stream_header::PartAttr;

/// Client side of resource binding: request the configured resource (or
/// let the server pick one) and adopt the bound JID.
pub struct ClientBindFeature {
    resource: Option<String>,
    request_id: String,
    handled: bool,
}

impl ClientBindFeature {
    pub fn new(resource: Option<&str>) -> Self {
        Self {
            resource: resource.map(|s| s.to_string()),
            request_id: Uuid::new_v4().to_string(),
            handled: false,
        }
    }

    pub fn handled(&self) -> bool {
        self.handled
    }

    pub fn matches(&self, advertisement: &Element) -> bool {
        !self.handled && advertisement.validate("bind", Some(namespaces::XMPP_BIND))
    }

    pub async fn handle<C: Connection>(
        &mut self,
        _advertisement: &Element,
        attr: &mut PartAttr,
        channel: &mut Channel<C>,
    ) -> Result<bool, Error> {
        self.handled = true;

        let mut request = Stanza {
            name: StanzaName::Iq.as_str().to_string(),
            stanza_type: Some(IqType::Set.to_string()),
            id: Some(self.request_id.clone()),
            from: None,
            to: None,
        }
        .to_element();
        request.with_child("bind", Some(namespaces::XMPP_BIND), |bind| {
            if let Some(resource) = &self.resource {
                bind.with_child("resource", Some(namespaces::XMPP_BIND), |r| {
                    r.add_text(resource.clone());
                });
            }
        });
        channel.send_element(request).await?;

        let reply = channel.next_element().await?;
        let stanza = Stanza::from_element(&reply, StanzaName::Iq)?;
        if stanza.id.as_deref() != Some(self.request_id.as_str()) {
            bail!("bind reply does not answer our request");
        }
        match stanza.iq_type() {
            Some(IqType::Result) => {}
            Some(IqType::Error) => {
                let detail = StanzaErrorElem::from_element(&reply)
                    .map(|err| err.condition)
                    .unwrap_or_else(|| "unspecified".to_string());
                bail!("resource bind refused: {detail}");
            }
            _ => bail!("unexpected bind reply type"),
        }

        let Some(jid_text) = reply
            .find_child("bind", Some(namespaces::XMPP_BIND))
            .and_then(|bind| bind.find_child("jid", Some(namespaces::XMPP_BIND)))
            .map(|jid| jid.text())
        else {
            bail!("bind result carries no jid");
        };
        let jid: Jid = jid_text.parse()?;
        attr.jid = Some(jid);

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_bind_advertisement_until_handled() {
        let mut feature = ClientBindFeature::new(Some("laptop"));
        let ad = Element::new("bind", Some(namespaces::XMPP_BIND));
        assert!(feature.matches(&ad));
        feature.handled = true;
        assert!(!feature.matches(&ad));
    }
}
