use std::sync::Arc;

use base64::prelude::*;
use uuid::Uuid;

use palaver_core::auth::PlainUserLookup;
use palaver_core::xml::{Element, namespaces};
use palaver_core::xmpp::stream::{Channel, Connection};

use super::{SaslError, auth_payload};

/// RFC 4616 PLAIN: one message of `authzid NUL authcid NUL passwd`,
/// verified against the stored password.
pub struct PlainAuth {
    lookup: Arc<dyn PlainUserLookup>,
}

impl PlainAuth {
    pub fn new(lookup: Arc<dyn PlainUserLookup>) -> Self {
        Self { lookup }
    }

    pub(super) async fn authenticate<C: Connection>(
        &self,
        initial: &str,
        channel: &mut Channel<C>,
    ) -> Result<String, SaslError> {
        let payload = auth_payload(initial)?;
        let fields: Vec<&[u8]> = payload.split(|byte| *byte == 0x00).collect();
        if fields.len() != 3 {
            return Err(SaslError::IncorrectEncoding);
        }
        let username =
            std::str::from_utf8(fields[1]).map_err(|_| SaslError::IncorrectEncoding)?;
        let password = fields[2];

        let user = self
            .lookup
            .user_by_username(username)
            .map_err(|err| SaslError::TemporaryAuthFailure(err.to_string()))?;
        if user.password.as_bytes() != password {
            return Err(SaslError::TemporaryAuthFailure("password error".to_string()));
        }

        let mut success = Element::new("success", Some(namespaces::XMPP_SASL));
        success.add_text(BASE64_STANDARD.encode(Uuid::new_v4().to_string()));
        channel.send_element(success).await.map_err(SaslError::from)?;

        Ok(username.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::auth::{PlainUser, UserLookupError};
    use palaver_core::xml::stream_codec::DEFAULT_MAX_STANZA_SIZE;
    use tokio::io::AsyncReadExt;

    struct OneUser;

    impl PlainUserLookup for OneUser {
        fn user_by_username(&self, username: &str) -> Result<PlainUser, UserLookupError> {
            if username == "test" {
                Ok(PlainUser {
                    username: "test".to_string(),
                    password: "123456".to_string(),
                })
            } else {
                Err(UserLookupError::NotFound)
            }
        }
    }

    fn channel() -> (Channel<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (local, peer) = tokio::io::duplex(4096);
        (Channel::new(local, true, DEFAULT_MAX_STANZA_SIZE), peer)
    }

    #[tokio::test]
    async fn accepts_valid_credentials() {
        let (mut channel, mut peer) = channel();
        let auth = PlainAuth::new(Arc::new(OneUser));

        // base64("\0test\0123456")
        let username = auth
            .authenticate("AHRlc3QAMTIzNDU2", &mut channel)
            .await
            .unwrap();
        assert_eq!(username, "test");

        let mut buf = vec![0u8; 256];
        let n = peer.read(&mut buf).await.unwrap();
        let written = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(written.starts_with("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>"));
        assert!(written.ends_with("</success>"));
    }

    #[tokio::test]
    async fn rejects_wrong_password() {
        let (mut channel, _peer) = channel();
        let auth = PlainAuth::new(Arc::new(OneUser));

        let payload = BASE64_STANDARD.encode(b"\0test\0wrong");
        assert!(matches!(
            auth.authenticate(&payload, &mut channel).await,
            Err(SaslError::TemporaryAuthFailure(_))
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_user() {
        let (mut channel, _peer) = channel();
        let auth = PlainAuth::new(Arc::new(OneUser));

        let payload = BASE64_STANDARD.encode(b"\0ghost\x00123456");
        assert!(matches!(
            auth.authenticate(&payload, &mut channel).await,
            Err(SaslError::TemporaryAuthFailure(_))
        ));
    }

    #[tokio::test]
    async fn rejects_payload_without_three_fields() {
        let (mut channel, _peer) = channel();
        let auth = PlainAuth::new(Arc::new(OneUser));

        let payload = BASE64_STANDARD.encode(b"test-no-separators");
        assert!(matches!(
            auth.authenticate(&payload, &mut channel).await,
            Err(SaslError::IncorrectEncoding)
        ));
    }
}
