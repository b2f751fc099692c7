//! Client side of the SCRAM mechanism family (RFC 5802).

use std::marker::PhantomData;

use anyhow::{Error, bail};
use base64::prelude::*;
use digest::{Digest, Output, core_api::BlockSizeUser};
use hmac::{Mac, SimpleHmac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use uuid::Uuid;

use palaver_core::xml::{Element, namespaces};
use palaver_core::xmpp::stream::{Channel, Connection};

use super::failure_message;

const TLS_EXPORTER: &str = "tls-exporter";

pub trait ClientScramDigest: Digest + BlockSizeUser + Clone + Send + Sync + 'static {}

impl ClientScramDigest for Sha1 {}
impl ClientScramDigest for Sha256 {}
impl ClientScramDigest for Sha512 {}

fn hmac<D: ClientScramDigest>(key: &[u8], data: &[u8]) -> Output<D> {
    let mut mac =
        SimpleHmac::<D>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes()
}

/// Client-side SCRAM state: derives the salted password from the
/// plaintext, proves it, and checks the server's signature back.
pub struct ScramToAuth<D> {
    username: String,
    password: String,
    channel_binding: bool,
    _digest: PhantomData<D>,
}

impl<D: ClientScramDigest> ScramToAuth<D> {
    pub fn new(username: &str, password: &str, channel_binding: bool) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            channel_binding,
            _digest: PhantomData,
        }
    }

    pub(super) fn username(&self) -> &str {
        &self.username
    }

    pub(super) async fn authenticate<C: Connection>(
        &self,
        mechanism: &str,
        channel: &mut Channel<C>,
    ) -> Result<(), Error> {
        let gs2_header = if self.channel_binding {
            format!("p={TLS_EXPORTER},,")
        } else {
            "n,,".to_string()
        };
        let mut binding_data = Vec::new();
        if self.channel_binding {
            channel.bind_tls_unique(&mut binding_data)?;
        }

        let client_nonce = Uuid::new_v4().to_string();
        let client_first_bare = format!("n={},r={}", self.username, client_nonce);
        let client_first = format!("{gs2_header}{client_first_bare}");

        let mut auth = Element::new("auth", Some(namespaces::XMPP_SASL));
        auth.set_attribute("mechanism", None, mechanism);
        auth.add_text(BASE64_STANDARD.encode(&client_first));
        channel.send_element(auth).await?;

        let challenge = channel.next_element().await?;
        if !challenge.validate("challenge", Some(namespaces::XMPP_SASL)) {
            bail!(failure_message(&challenge));
        }
        let server_first = String::from_utf8(BASE64_STANDARD.decode(challenge.text().trim())?)?;
        let (server_nonce, salt, iterations) = parse_server_first(&server_first)?;
        if !server_nonce.starts_with(&client_nonce) {
            bail!("server nonce does not extend the client nonce");
        }

        let mut salted = vec![0u8; <D as Digest>::output_size()];
        pbkdf2::pbkdf2::<SimpleHmac<D>>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted,
        )
        .map_err(|_| anyhow::anyhow!("pbkdf2 output length mismatch"))?;

        let mut bind_input = gs2_header.as_bytes().to_vec();
        bind_input.extend_from_slice(&binding_data);
        let without_proof = format!(
            "c={},r={}",
            BASE64_STANDARD.encode(&bind_input),
            server_nonce
        );
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

        let client_key = hmac::<D>(&salted, b"Client Key");
        let stored_key = D::digest(&client_key);
        let client_signature = hmac::<D>(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(key, signature)| key ^ signature)
            .collect();

        let mut response = Element::new("response", Some(namespaces::XMPP_SASL));
        response.add_text(BASE64_STANDARD.encode(format!(
            "{without_proof},p={}",
            BASE64_STANDARD.encode(&proof)
        )));
        channel.send_element(response).await?;

        let success = channel.next_element().await?;
        if !success.validate("success", Some(namespaces::XMPP_SASL)) {
            bail!(failure_message(&success));
        }
        let server_final = String::from_utf8(BASE64_STANDARD.decode(success.text().trim())?)?;
        let Some(signature) = server_final.strip_prefix("v=") else {
            bail!("server final message carries no signature");
        };

        let server_key = hmac::<D>(&salted, b"Server Key");
        let expected = BASE64_STANDARD.encode(hmac::<D>(&server_key, auth_message.as_bytes()));
        if signature != expected {
            bail!("server signature mismatch");
        }

        Ok(())
    }
}

fn parse_server_first(message: &str) -> Result<(String, Vec<u8>, u32), Error> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;
    for attr in message.split(',') {
        if let Some((key, value)) = attr.split_once('=') {
            match key {
                "r" => nonce = Some(value.to_string()),
                "s" => salt = Some(BASE64_STANDARD.decode(value)?),
                "i" => iterations = Some(value.parse::<u32>()?),
                _ => {}
            }
        }
    }
    match (nonce, salt, iterations) {
        (Some(nonce), Some(salt), Some(iterations)) => Ok((nonce, salt, iterations)),
        _ => bail!("malformed server-first-message: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_first_message() {
        let salt = BASE64_STANDARD.encode(b"0123456789abcdef");
        let message = format!("r=abc-def,s={salt},i=4096");
        let (nonce, parsed_salt, iterations) = parse_server_first(&message).unwrap();
        assert_eq!(nonce, "abc-def");
        assert_eq!(parsed_salt, b"0123456789abcdef");
        assert_eq!(iterations, 4096);
    }

    #[test]
    fn rejects_incomplete_server_first_message() {
        assert!(parse_server_first("r=abc,i=4096").is_err());
        assert!(parse_server_first("").is_err());
    }
}
