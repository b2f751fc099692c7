use std::sync::Arc;

use palaver_core::auth::Authorized;
use palaver_core::xml::namespaces;
use palaver_core::xmpp::part::{ElemHandler, SessionHandle};
use palaver_core::xmpp::stream::Connection;

use crate::sasl::{Mechanism, SaslFeature};
use crate::starttls::TlsFeature;
use crate::{ServerFeature, ServerPart};

/// Assembles the server-to-server feature set: STARTTLS and SASL only,
/// under the `jabber:server` default namespace.
pub struct S2s<C: Connection> {
    part: ServerPart<C>,
    tls: Option<TlsFeature>,
    sasl: Option<SaslFeature>,
}

impl<C: Connection> S2s<C> {
    pub fn new(connection: C, domain: &str, max_stanza_size: usize) -> Self {
        let mut part = ServerPart::new(connection, domain, max_stanza_size);
        part.attr_mut().default_namespace = namespaces::XMPP_SERVER.to_string();
        Self {
            part,
            tls: None,
            sasl: None,
        }
    }

    pub fn with_tls(mut self, mandatory: bool) -> Self {
        self.tls = Some(TlsFeature::new(mandatory));
        self
    }

    pub fn with_sasl(mut self, authorized: Arc<dyn Authorized>) -> Self {
        self.sasl = Some(SaslFeature::new(authorized));
        self
    }

    pub fn with_sasl_support(mut self, name: &str, mechanism: Mechanism) -> Self {
        if let Some(sasl) = &mut self.sasl {
            sasl.support(name, mechanism);
        }
        self
    }

    pub fn with_elem_handler(mut self, handler: Box<dyn ElemHandler<C>>) -> Self {
        self.part.with_elem_handler(handler);
        self
    }

    pub fn session_handle(&self) -> SessionHandle {
        self.part.session_handle()
    }

    pub async fn start(mut self) {
        if let Some(tls) = self.tls.take() {
            self.part.with_feature(ServerFeature::Tls(tls));
        }
        if let Some(sasl) = self.sasl.take() {
            self.part.with_feature(ServerFeature::Sasl(sasl));
        }
        self.part.handle().await
    }
}
