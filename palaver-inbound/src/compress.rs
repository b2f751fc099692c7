use anyhow::{Error, bail};

use palaver_core::compress::CompressionMethod;
use palaver_core::xml::{Element, namespaces};
use palaver_core::xmpp::stanza::Failure;
use palaver_core::xmpp::stream::{Channel, Connection};

/// XEP-0138 stream compression: method negotiation, then a filter swap on
/// the transport and a stream restart.
pub struct CompressFeature {
    supported: Vec<(String, CompressionMethod)>,
    handled: bool,
}

impl CompressFeature {
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

    pub fn advertisement(&self) -> Element {
        let mut compression = Element::new("compression", Some(namespaces::COMPRESS));
        for (name, _) in &self.supported {
            compression.with_child("method", Some(namespaces::COMPRESS), |method| {
                method.add_text(name.clone());
            });
        }
        compression
    }

    pub fn matches(&self, element: &Element) -> bool {
        element.validate("compress", Some(namespaces::COMPRESS))
    }

    pub async fn handle<C: Connection>(
        &mut self,
        element: &Element,
        channel: &mut Channel<C>,
    ) -> Result<(), Error> {
        self.handled = true;

        let requested = element
            .find_child("method", Some(namespaces::COMPRESS))
            .map(|method| method.text())
            .unwrap_or_default();
        if requested.is_empty() {
            let failure = Failure::new(namespaces::COMPRESS, "setup-failed");
            channel.send_element(failure.to_element()).await?;
            bail!("compress request without a method");
        }

        let Some((_, method)) = self.supported.iter().find(|(name, _)| *name == requested)
        else {
            let failure = Failure::new(namespaces::COMPRESS, "unsupported-method");
            channel.send_element(failure.to_element()).await?;
            bail!("unsupported compression method `{requested}`");
        };
        let method = *method;

        channel
            .send_element(Element::new("compressed", Some(namespaces::COMPRESS)))
            .await?;
        channel.start_compress(method)?;
        Ok(())
    }
}

impl Default for CompressFeature {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::xml::stream_codec::DEFAULT_MAX_STANZA_SIZE;
    use tokio::io::AsyncReadExt;

    fn compress_request(method: Option<&str>) -> Element {
        let mut compress = Element::new("compress", Some(namespaces::COMPRESS));
        if let Some(method) = method {
            compress.with_child("method", Some(namespaces::COMPRESS), |m| {
                m.add_text(method);
            });
        }
        compress
    }

    fn feature() -> CompressFeature {
        let mut feature = CompressFeature::new();
        feature.support("zlib", CompressionMethod::Zlib);
        feature
    }

    #[test]
    fn advertisement_lists_methods() {
        let ad = feature().advertisement();
        assert!(ad.validate("compression", Some(namespaces::COMPRESS)));
        let methods: Vec<String> = ad.child_elements().map(|m| m.text()).collect();
        assert_eq!(methods, vec!["zlib"]);
    }

    #[tokio::test]
    async fn missing_method_is_setup_failed() {
        let (local, mut peer) = tokio::io::duplex(4096);
        let mut channel = Channel::new(local, true, DEFAULT_MAX_STANZA_SIZE);

        let result = feature()
            .handle(&compress_request(None), &mut channel)
            .await;
        assert!(result.is_err());

        let mut buf = vec![0u8; 256];
        let n = peer.read(&mut buf).await.unwrap();
        let written = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(written.contains("<setup-failed"));
    }

    #[tokio::test]
    async fn unknown_method_is_unsupported() {
        let (local, mut peer) = tokio::io::duplex(4096);
        let mut channel = Channel::new(local, true, DEFAULT_MAX_STANZA_SIZE);

        let result = feature()
            .handle(&compress_request(Some("lzw")), &mut channel)
            .await;
        assert!(result.is_err());

        let mut buf = vec![0u8; 256];
        let n = peer.read(&mut buf).await.unwrap();
        let written = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(written.contains("<unsupported-method"));
    }
}
