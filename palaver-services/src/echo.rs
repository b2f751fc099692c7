use anyhow::Error;
use futures::future::BoxFuture;
use tracing::info;

use palaver_core::xml::Element;
use palaver_core::xmpp::part::{ElemHandler, PartContext};
use palaver_core::xmpp::stream::Connection;

use crate::router::RouterHandle;

/// Sends every message straight back to the stream it arrived on, with
/// the sender as the new addressee.
pub struct EchoHandler;

impl<C: Connection> ElemHandler<C> for EchoHandler {
    fn id(&self) -> &str {
        "echo-message"
    }

    fn matches(&self, element: &Element) -> bool {
        element.is_named("message")
    }

    fn handle<'a, 'c: 'a>(
        &'a mut self,
        element: &'a Element,
        ctx: &'a mut PartContext<'c, C>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            info!("echoing a message back");
            let mut reply = Element::new("message", None);
            if let Some(jid) = &ctx.attr.jid {
                reply.set_attribute("to", None, jid.to_string());
            }
            reply.set_attribute("from", None, ctx.attr.domain.clone());
            for child in element.child_elements() {
                reply.add_child(child.clone());
            }
            ctx.channel.send_element(reply).await?;
            Ok(())
        })
    }
}

/// Forwards addressed messages to whatever session the router knows for
/// the target JID. Messages without a `to` fall through to later
/// handlers.
pub struct MessageRouter {
    router: RouterHandle,
}

impl MessageRouter {
    pub fn new(router: RouterHandle) -> Self {
        Self { router }
    }
}

impl<C: Connection> ElemHandler<C> for MessageRouter {
    fn id(&self) -> &str {
        "message-router"
    }

    fn matches(&self, element: &Element) -> bool {
        element.is_named("message") && element.attribute("to", None).is_some()
    }

    fn handle<'a, 'c: 'a>(
        &'a mut self,
        element: &'a Element,
        ctx: &'a mut PartContext<'c, C>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut forwarded = element.clone();
            if let Some(jid) = &ctx.attr.jid {
                forwarded.set_attribute("from", None, jid.to_string());
            }
            self.router.route(forwarded).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    #[test]
    fn echo_matches_messages_only() {
        let handler = EchoHandler;
        assert!(ElemHandler::<DuplexStream>::matches(
            &handler,
            &Element::new("message", None)
        ));
        assert!(!ElemHandler::<DuplexStream>::matches(
            &handler,
            &Element::new("iq", None)
        ));
    }

    #[tokio::test]
    async fn message_router_requires_an_addressee() {
        let handler = MessageRouter::new(RouterHandle::new());
        let mut addressed = Element::new("message", None);
        addressed.set_attribute("to", None, "a@x.im");
        assert!(ElemHandler::<DuplexStream>::matches(&handler, &addressed));
        assert!(!ElemHandler::<DuplexStream>::matches(
            &handler,
            &Element::new("message", None)
        ));
    }
}
