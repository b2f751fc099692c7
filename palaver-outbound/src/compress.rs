use anyhow::Error;
use tracing::warn;

use palaver_core::compress::CompressionMethod;
use palaver_core::xml::{Element, namespaces};
use palaver_core::xmpp::stanza::Failure;
use palaver_core::xmpp::stream::{Channel, Connection};

/// Client side of stream compression: pick the first mutually supported
/// method and install the filter once the server confirms.
pub struct ClientCompressFeature {
    supported: Vec<(String, CompressionMethod)>,
    handled: bool,
}

impl ClientCompressFeature {
    pub fn new() -> Self {
        Self {
            supported: Vec::new(),
            handled: false,
        }
    }

    pub fn support(&mut self, name: &str, method: CompressionMethod) -> &mut Self {
        self.supported.push((name.to_string(), method));
        self
    }

    pub fn handled(&self) -> bool {
        self.handled
    }

    pub fn matches(&self, advertisement: &Element) -> bool {
        !self.handled && advertisement.is_named("compression")
    }

    pub async fn handle<C: Connection>(
        &mut self,
        advertisement: &Element,
        channel: &mut Channel<C>,
    ) -> Result<bool, Error> {
        self.handled = true;

        let offered: Vec<String> = advertisement
            .child_elements()
            .filter(|child| child.is_named("method"))
            .map(|child| child.text())
            .collect();
        let Some((name, method)) = self
            .supported
            .iter()
            .find(|(name, _)| offered.iter().any(|offer| offer == name))
        else {
            // Compression is optional; nothing in common just means we go
            // on uncompressed.
            return Ok(false);
        };
        let method = *method;

        let mut compress = Element::new("compress", Some(namespaces::COMPRESS));
        compress.with_child("method", Some(namespaces::COMPRESS), |m| {
            m.add_text(name.clone());
        });
        channel.send_element(compress).await?;

        let reply = channel.next_element().await?;
        if !reply.validate("compressed", Some(namespaces::COMPRESS)) {
            let condition = Failure::from_element(&reply, namespaces::COMPRESS)
                .map(|failure| failure.condition)
                .unwrap_or_else(|_| format!("unexpected element <{}>", reply.name()));
            warn!("compression setup failed: {condition}");
            return Ok(false);
        }

        channel.start_compress(method)?;
        Ok(true)
    }
}

impl Default for ClientCompressFeature {
    fn default() -> Self {
        Self::new()
    }
}
