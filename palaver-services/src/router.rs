use std::collections::HashMap;

use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use palaver_core::auth::{Authorized, BindRequestError, ResourceBinder};
use palaver_core::xml::Element;
use palaver_core::xmpp::jid::Jid;
use palaver_core::xmpp::part::SessionHandle;

#[derive(Debug)]
pub enum ManagementCommand {
    Register(Jid, SessionHandle),
    Unregister(Jid),
}

struct Router {
    stanzas: mpsc::Receiver<Element>,
    management: mpsc::UnboundedReceiver<ManagementCommand>,
    entities: HashMap<Jid, SessionHandle>,
}

impl Router {
    async fn run(&mut self) {
        loop {
            select! {
                Some(element) = self.stanzas.recv() => {
                    self.route(element).await;
                }
                Some(command) = self.management.recv() => {
                    self.handle_management_command(command);
                }
                else => return,
            }
        }
    }

    async fn route(&mut self, element: Element) {
        let Some(to) = element.attribute("to", None) else {
            debug!("dropping stanza without a to address");
            return;
        };
        let Ok(jid) = to.parse::<Jid>() else {
            warn!("dropping stanza with unparsable to address {to:?}");
            return;
        };

        let target = self
            .entities
            .get(&jid)
            .or_else(|| self.entities.get(&jid.to_bare()));
        match target {
            Some(session) => {
                if session.send(element).await.is_err() {
                    // The session is gone; drop the registration with it.
                    self.entities.remove(&jid);
                    self.entities.remove(&jid.to_bare());
                }
            }
            None => debug!("no session registered for {jid}"),
        }
    }

    fn handle_management_command(&mut self, command: ManagementCommand) {
        match command {
            ManagementCommand::Register(jid, session) => {
                self.entities.insert(jid, session);
            }
            ManagementCommand::Unregister(jid) => {
                self.entities.remove(&jid);
            }
        }
    }
}

/// Handle onto the routing task. Registered as both the authorized-session
/// registry and the resource binder of inbound streams.
#[derive(Clone)]
pub struct RouterHandle {
    stanzas: mpsc::Sender<Element>,
    management: mpsc::UnboundedSender<ManagementCommand>,
}

impl RouterHandle {
    pub fn new() -> Self {
        let (stanzas_tx, stanzas_rx) = mpsc::channel(8);
        let (management_tx, management_rx) = mpsc::unbounded_channel();
        let mut router = Router {
            stanzas: stanzas_rx,
            management: management_rx,
            entities: HashMap::new(),
        };
        tokio::spawn(async move {
            router.run().await;
        });

        RouterHandle {
            stanzas: stanzas_tx,
            management: management_tx,
        }
    }

    pub async fn route(&self, element: Element) -> Result<(), anyhow::Error> {
        self.stanzas
            .send(element)
            .await
            .map_err(|_| anyhow::anyhow!("router is gone"))
    }

    pub fn register(&self, jid: Jid, session: SessionHandle) {
        let _ = self
            .management
            .send(ManagementCommand::Register(jid, session));
    }

    pub fn unregister(&self, jid: Jid) {
        let _ = self.management.send(ManagementCommand::Unregister(jid));
    }
}

impl Default for RouterHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Authorized for RouterHandle {
    fn authorized(&self, jid: &Jid, session: &SessionHandle) {
        self.register(jid.to_bare(), session.clone());
    }
}

impl ResourceBinder for RouterHandle {
    fn bind_resource(
        &self,
        jid: &Jid,
        resource: &str,
        session: &SessionHandle,
    ) -> Result<Jid, BindRequestError> {
        let full = jid.with_resource(resource);
        self.register(full.clone(), session.clone());
        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_to(to: &str) -> Element {
        let mut message = Element::new("message", None);
        message.set_attribute("to", None, to);
        message.with_child("body", None, |body| body.add_text("hi"));
        message
    }

    #[tokio::test]
    async fn routes_to_registered_full_jid() {
        let router = RouterHandle::new();
        let (tx, mut rx) = mpsc::channel(4);
        router.register("test@x.im/laptop".parse().unwrap(), SessionHandle::new(tx));

        router.route(message_to("test@x.im/laptop")).await.unwrap();
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.attribute("to", None), Some("test@x.im/laptop"));
    }

    #[tokio::test]
    async fn falls_back_to_bare_jid() {
        let router = RouterHandle::new();
        let (tx, mut rx) = mpsc::channel(4);
        router.register("test@x.im".parse().unwrap(), SessionHandle::new(tx));

        router.route(message_to("test@x.im/phone")).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn bind_resource_returns_full_jid() {
        let router = RouterHandle::new();
        let (tx, _rx) = mpsc::channel(4);
        let session = SessionHandle::new(tx);
        let bound = router
            .bind_resource(&"test@x.im".parse().unwrap(), "laptop", &session)
            .unwrap();
        assert_eq!(bound.to_string(), "test@x.im/laptop");
    }
}
