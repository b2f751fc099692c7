use anyhow::Error;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::xml::Element;
use crate::xmpp::stream::{Channel, Connection};
use crate::xmpp::stream_header::PartAttr;

/// What a feature or application handler may touch while it runs: the
/// negotiated stream state and the channel. Handlers borrow these for the
/// duration of a single dispatch and never outlive it.
pub struct PartContext<'a, C: Connection> {
    pub attr: &'a mut PartAttr,
    pub channel: &'a mut Channel<C>,
}

/// An application-level element handler, active once negotiation has
/// finished. Dispatch is strictly sequential within a stream.
pub trait ElemHandler<C: Connection>: Send {
    /// Stable identity used to deduplicate registrations.
    fn id(&self) -> &str;
    fn matches(&self, element: &Element) -> bool;
    fn handle<'a, 'c: 'a>(
        &'a mut self,
        element: &'a Element,
        ctx: &'a mut PartContext<'c, C>,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

/// Ordered handler registry; a second registration under an existing id is
/// ignored.
pub struct ElemHandlers<C: Connection> {
    handlers: Vec<Box<dyn ElemHandler<C>>>,
}

impl<C: Connection> ElemHandlers<C> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn add(&mut self, handler: Box<dyn ElemHandler<C>>) {
        if self.handlers.iter().any(|h| h.id() == handler.id()) {
            return;
        }
        self.handlers.push(handler);
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn ElemHandler<C>>> {
        self.handlers.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C: Connection> Default for ElemHandlers<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle onto a running stream session, given out to external
/// collaborators (router, authorized registry) for pushing stanzas back
/// into the stream's write path.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    outbound: mpsc::Sender<Element>,
}

impl SessionHandle {
    pub fn new(outbound: mpsc::Sender<Element>) -> Self {
        Self { outbound }
    }

    pub async fn send(&self, element: Element) -> Result<(), Error> {
        self.outbound
            .send(element)
            .await
            .map_err(|_| anyhow::anyhow!("session is gone"))
    }

    pub fn try_send(&self, element: Element) -> Result<(), Error> {
        self.outbound
            .try_send(element)
            .map_err(|_| anyhow::anyhow!("session is gone or busy"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    struct NamedHandler(&'static str);

    impl ElemHandler<DuplexStream> for NamedHandler {
        fn id(&self) -> &str {
            self.0
        }

        fn matches(&self, _element: &Element) -> bool {
            true
        }

        fn handle<'a, 'c: 'a>(
            &'a mut self,
            _element: &'a Element,
            _ctx: &'a mut PartContext<'c, DuplexStream>,
        ) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn duplicate_handler_ids_are_ignored() {
        let mut handlers = ElemHandlers::<DuplexStream>::new();
        handlers.add(Box::new(NamedHandler("echo")));
        handlers.add(Box::new(NamedHandler("echo")));
        handlers.add(Box::new(NamedHandler("router")));
        assert_eq!(handlers.iter_mut().count(), 2);
    }
}
