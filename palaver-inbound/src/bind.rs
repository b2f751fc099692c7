use std::sync::Arc;

use anyhow::{Error, bail};
use uuid::Uuid;

use palaver_core::auth::{BindRequestError, ResourceBinder};
use palaver_core::xml::{Element, namespaces};
use palaver_core::xmpp::part::SessionHandle;
use palaver_core::xmpp::stanza::{IqType, Stanza, StanzaErrorElem, StanzaName};
use palaver_core::xmpp::stream::{Channel, Connection};
use palaver_core::xmpp::stream_header::PartAttr;

/// Resource binding (RFC 6120 §7): an IQ-set carrying
/// `<bind xmlns='…xmpp-bind'>` with an optional requested resource.
pub struct BindFeature {
    binder: Arc<dyn ResourceBinder>,
    mandatory: bool,
    handled: bool,
}

impl BindFeature {
    pub fn new(binder: Arc<dyn ResourceBinder>, mandatory: bool) -> Self {
        Self {
            binder,
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
        let mut bind = Element::new("bind", Some(namespaces::XMPP_BIND));
        if self.mandatory {
            bind.add_child(Element::new("required", Some(namespaces::XMPP_BIND)));
        }
        bind
    }

    pub fn matches(&self, element: &Element) -> bool {
        let Ok(stanza) = Stanza::from_element(element, StanzaName::Iq) else {
            return false;
        };
        stanza.iq_type() == Some(IqType::Set)
            && stanza.id.is_some()
            && element.find_child("bind", Some(namespaces::XMPP_BIND)).is_some()
    }

    pub async fn handle<C: Connection>(
        &mut self,
        element: &Element,
        attr: &mut PartAttr,
        channel: &mut Channel<C>,
        session: &SessionHandle,
    ) -> Result<(), Error> {
        self.handled = true;

        let stanza = Stanza::from_element(element, StanzaName::Iq)?;
        let request_id = stanza.id.clone().unwrap_or_default();
        let Some(bind_request) = element.find_child("bind", Some(namespaces::XMPP_BIND)) else {
            bail!("iq does not contain a bind request");
        };
        let resource = match bind_request.find_child("resource", Some(namespaces::XMPP_BIND)) {
            Some(requested) if !requested.text().is_empty() => requested.text(),
            _ => Uuid::new_v4().to_string(),
        };

        let Some(jid) = attr.jid.clone() else {
            let reply = bind_error_reply(&request_id, &BindRequestError::NotAllowed);
            channel.send_element(reply).await?;
            bail!("resource bind before authentication");
        };

        match self.binder.bind_resource(&jid.to_bare(), &resource, session) {
            Ok(full_jid) => {
                attr.jid = Some(full_jid.clone());

                let mut reply = Stanza {
                    name: StanzaName::Iq.as_str().to_string(),
                    stanza_type: Some(IqType::Result.to_string()),
                    id: Some(request_id),
                    from: None,
                    to: stanza.from.clone(),
                }
                .to_element();
                reply.with_child("bind", Some(namespaces::XMPP_BIND), |bind| {
                    bind.with_child("jid", Some(namespaces::XMPP_BIND), |jid_elem| {
                        jid_elem.add_text(full_jid.to_string());
                    });
                });
                channel.send_element(reply).await?;
                Ok(())
            }
            Err(err) => {
                let reply = bind_error_reply(&request_id, &err);
                channel.send_element(reply).await?;
                bail!(err);
            }
        }
    }
}

fn bind_error_reply(request_id: &str, err: &BindRequestError) -> Element {
    let mut reply = Stanza {
        name: StanzaName::Iq.as_str().to_string(),
        stanza_type: Some(IqType::Error.to_string()),
        id: Some(request_id.to_string()),
        from: None,
        to: None,
    }
    .to_element();
    reply.add_child(
        StanzaErrorElem {
            error_type: err.error_type().to_string(),
            condition: err.condition().to_string(),
        }
        .to_element(),
    );
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::xml::stream_codec::DEFAULT_MAX_STANZA_SIZE;
    use palaver_core::xmpp::jid::Jid;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    struct AcceptAll;

    impl ResourceBinder for AcceptAll {
        fn bind_resource(
            &self,
            jid: &Jid,
            resource: &str,
            _session: &SessionHandle,
        ) -> Result<Jid, BindRequestError> {
            Ok(jid.with_resource(resource))
        }
    }

    struct RefuseAll;

    impl ResourceBinder for RefuseAll {
        fn bind_resource(
            &self,
            _jid: &Jid,
            _resource: &str,
            _session: &SessionHandle,
        ) -> Result<Jid, BindRequestError> {
            Err(BindRequestError::ResourceConstraint)
        }
    }

    fn bind_iq(resource: Option<&str>) -> Element {
        let mut iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        iq.set_attribute("type", None, "set");
        iq.set_attribute("id", None, "bind_1");
        iq.with_child("bind", Some(namespaces::XMPP_BIND), |bind| {
            if let Some(resource) = resource {
                bind.with_child("resource", Some(namespaces::XMPP_BIND), |r| {
                    r.add_text(resource);
                });
            }
        });
        iq
    }

    fn session() -> SessionHandle {
        let (tx, _rx) = mpsc::channel(1);
        SessionHandle::new(tx)
    }

    #[test]
    fn matches_only_iq_set_with_bind_child() {
        let feature = BindFeature::new(Arc::new(AcceptAll), false);
        assert!(feature.matches(&bind_iq(Some("laptop"))));

        let mut get = bind_iq(None);
        get.set_attribute("type", None, "get");
        assert!(!feature.matches(&get));

        let mut plain_iq = Element::new("iq", None);
        plain_iq.set_attribute("type", None, "set");
        plain_iq.set_attribute("id", None, "x");
        assert!(!feature.matches(&plain_iq));
    }

    #[tokio::test]
    async fn binds_requested_resource() {
        let (local, mut peer) = tokio::io::duplex(4096);
        let mut channel = Channel::new(local, true, DEFAULT_MAX_STANZA_SIZE);
        let mut attr = PartAttr::new("x.im");
        attr.jid = Some("test@x.im".parse().unwrap());

        let mut feature = BindFeature::new(Arc::new(AcceptAll), false);
        feature
            .handle(&bind_iq(Some("laptop")), &mut attr, &mut channel, &session())
            .await
            .unwrap();

        assert_eq!(attr.jid.as_ref().unwrap().to_string(), "test@x.im/laptop");

        let mut buf = vec![0u8; 512];
        let n = peer.read(&mut buf).await.unwrap();
        let written = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(written.contains("type='result'"));
        assert!(written.contains("id='bind_1'"));
        assert!(written.contains("<jid>test@x.im/laptop</jid>"));
    }

    #[tokio::test]
    async fn generates_resource_when_none_requested() {
        let (local, _peer) = tokio::io::duplex(4096);
        let mut channel = Channel::new(local, true, DEFAULT_MAX_STANZA_SIZE);
        let mut attr = PartAttr::new("x.im");
        attr.jid = Some("test@x.im".parse().unwrap());

        let mut feature = BindFeature::new(Arc::new(AcceptAll), false);
        feature
            .handle(&bind_iq(None), &mut attr, &mut channel, &session())
            .await
            .unwrap();

        assert!(attr.jid.as_ref().unwrap().resource().is_some());
    }

    #[tokio::test]
    async fn binder_refusal_becomes_error_iq() {
        let (local, mut peer) = tokio::io::duplex(4096);
        let mut channel = Channel::new(local, true, DEFAULT_MAX_STANZA_SIZE);
        let mut attr = PartAttr::new("x.im");
        attr.jid = Some("test@x.im".parse().unwrap());

        let mut feature = BindFeature::new(Arc::new(RefuseAll), false);
        let result = feature
            .handle(&bind_iq(Some("laptop")), &mut attr, &mut channel, &session())
            .await;
        assert!(result.is_err());

        let mut buf = vec![0u8; 512];
        let n = peer.read(&mut buf).await.unwrap();
        let written = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(written.contains("type='error'"));
        assert!(written.contains("<resource-constraint"));
        assert!(written.contains("type='wait'"));
    }
}
