use std::sync::Arc;
use std::time::Duration;

use palaver_core::auth::{Authorized, ResourceBinder};
use palaver_core::compress::CompressionMethod;
use palaver_core::xmpp::part::{ElemHandler, SessionHandle};
use palaver_core::xmpp::stream::Connection;

use crate::bind::BindFeature;
use crate::compress::CompressFeature;
use crate::sasl::{Mechanism, SaslFeature};
use crate::starttls::TlsFeature;
use crate::{ServerFeature, ServerPart};

/// Assembles the standard client-to-server feature set onto a server part:
/// STARTTLS, SASL, resource binding and stream compression, in that order.
pub struct C2s<C: Connection> {
    part: ServerPart<C>,
    tls: Option<TlsFeature>,
    sasl: Option<SaslFeature>,
    bind: Option<BindFeature>,
    compress: Option<CompressFeature>,
}

impl<C: Connection> C2s<C> {
    pub fn new(connection: C, domain: &str, max_stanza_size: usize) -> Self {
        Self {
            part: ServerPart::new(connection, domain, max_stanza_size),
            tls: None,
            sasl: None,
            bind: None,
            compress: None,
        }
    }

    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.part = self.part.with_close_grace(close_grace);
        self
    }

    pub fn with_tls(mut self, mandatory: bool) -> Self {
        self.tls = Some(TlsFeature::new(mandatory));
        self
    }

    pub fn with_sasl(mut self, authorized: Arc<dyn Authorized>) -> Self {
        self.sasl = Some(SaslFeature::new(authorized));
        self
    }

    /// Registers a mechanism with the SASL feature; `with_sasl` must have
    /// been called first.
    pub fn with_sasl_support(mut self, name: &str, mechanism: Mechanism) -> Self {
        if let Some(sasl) = &mut self.sasl {
            sasl.support(name, mechanism);
        }
        self
    }

    pub fn with_bind(mut self, binder: Arc<dyn ResourceBinder>, mandatory: bool) -> Self {
        self.bind = Some(BindFeature::new(binder, mandatory));
        self
    }

    pub fn with_compress_support(mut self, name: &str, method: CompressionMethod) -> Self {
        self.compress
            .get_or_insert_with(CompressFeature::new)
            .support(name, method);
        self
    }

    pub fn with_elem_handler(mut self, handler: Box<dyn ElemHandler<C>>) -> Self {
        self.part.with_elem_handler(handler);
        self
    }

    pub fn session_handle(&self) -> SessionHandle {
        self.part.session_handle()
    }

    pub fn part_mut(&mut self) -> &mut ServerPart<C> {
        &mut self.part
    }

    /// Runs the stream to completion with the configured features.
    pub async fn start(mut self) {
        if let Some(tls) = self.tls.take() {
            self.part.with_feature(ServerFeature::Tls(tls));
        }
        if let Some(sasl) = self.sasl.take() {
            self.part.with_feature(ServerFeature::Sasl(sasl));
        }
        if let Some(bind) = self.bind.take() {
            self.part.with_feature(ServerFeature::Bind(bind));
        }
        if let Some(compress) = self.compress.take() {
            self.part.with_feature(ServerFeature::Compress(compress));
        }
        self.part.handle().await
    }
}
