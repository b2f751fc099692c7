//! Server side of the SCRAM mechanism family (RFC 5802), with the
//! RFC 9266 `tls-exporter` channel binding for the `-PLUS` variants.

use std::marker::PhantomData;
use std::sync::Arc;

use base64::prelude::*;
use digest::{Digest, Output, core_api::BlockSizeUser};
use hmac::{Mac, SimpleHmac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use uuid::Uuid;

use palaver_core::auth::{ScramUser, ScramUserLookup};
use palaver_core::xml::{Element, namespaces};
use palaver_core::xmpp::stream::{Channel, Connection};

use super::{SaslError, auth_payload};

pub const TLS_EXPORTER: &str = "tls-exporter";

/// Hash functions usable with SCRAM, keyed by the name the credential
/// store files salted passwords under.
pub trait ScramDigest: Digest + BlockSizeUser + Clone + Send + Sync + 'static {
    const HASH_NAME: &'static str;
}

impl ScramDigest for Sha1 {
    const HASH_NAME: &'static str = "SHA-1";
}

impl ScramDigest for Sha256 {
    const HASH_NAME: &'static str = "SHA-256";
}

impl ScramDigest for Sha512 {
    const HASH_NAME: &'static str = "SHA-512";
}

pub(crate) fn hmac<D: ScramDigest>(key: &[u8], data: &[u8]) -> Output<D> {
    let mut mac =
        SimpleHmac::<D>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes()
}

struct ClientFirst {
    gs2_header: String,
    binding_name: Option<String>,
    username: String,
    bare: String,
}

fn parse_client_first(message: &str) -> Result<ClientFirst, SaslError> {
    let mut parts = message.splitn(3, ',');
    let (Some(flag), Some(authzid), Some(bare)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(SaslError::MalformedRequest(
            "client-first-message too short".to_string(),
        ));
    };

    let binding_name = match flag {
        "n" | "y" => None,
        _ if flag.starts_with("p=") && flag.len() > 2 => Some(flag[2..].to_string()),
        _ => {
            return Err(SaslError::MalformedRequest(
                "bad gs2-cbind-flag".to_string(),
            ));
        }
    };

    if !authzid.is_empty() {
        match authzid.split_once('=') {
            Some(("a", _)) => {}
            _ => return Err(SaslError::MalformedRequest("bad authzid".to_string())),
        }
    }

    let mut username = None;
    let mut nonce = None;
    for attr in bare.split(',') {
        if let Some((key, value)) = attr.split_once('=') {
            match key {
                "n" => username = Some(value.to_string()),
                "r" => nonce = Some(value.to_string()),
                _ => {}
            }
        }
    }
    let (Some(username), Some(nonce)) = (username, nonce) else {
        return Err(SaslError::MalformedRequest(
            "missing n or r attribute".to_string(),
        ));
    };
    if username.is_empty() || nonce.is_empty() {
        return Err(SaslError::MalformedRequest(
            "empty n or r attribute".to_string(),
        ));
    }

    Ok(ClientFirst {
        gs2_header: format!("{},{},", flag, authzid),
        binding_name,
        username,
        bare: bare.to_string(),
    })
}

struct ClientFinal {
    channel_binding: String,
    nonce: String,
    proof: Vec<u8>,
    without_proof: String,
}

fn parse_client_final(message: &str) -> Result<ClientFinal, SaslError> {
    let Some((without_proof, proof)) = message.rsplit_once(",p=") else {
        return Err(SaslError::MalformedRequest("missing proof".to_string()));
    };
    let proof = BASE64_STANDARD
        .decode(proof)
        .map_err(|_| SaslError::IncorrectEncoding)?;

    let mut channel_binding = None;
    let mut nonce = None;
    for attr in without_proof.split(',') {
        if let Some((key, value)) = attr.split_once('=') {
            match key {
                "c" => channel_binding = Some(value.to_string()),
                "r" => nonce = Some(value.to_string()),
                _ => {}
            }
        }
    }
    let (Some(channel_binding), Some(nonce)) = (channel_binding, nonce) else {
        return Err(SaslError::MalformedRequest(
            "missing c or r attribute".to_string(),
        ));
    };

    Ok(ClientFinal {
        channel_binding,
        nonce,
        proof,
        without_proof: without_proof.to_string(),
    })
}

/// One SCRAM exchange, transport-free: the mechanism feeds it the decoded
/// messages and writes whatever it returns back to the wire.
pub(crate) struct ScramExchange<D: ScramDigest> {
    client_first: ClientFirst,
    user: ScramUser,
    server_nonce: String,
    server_first: String,
    _digest: PhantomData<D>,
}

impl<D: ScramDigest> ScramExchange<D> {
    pub(crate) fn new(
        channel_binding: bool,
        message: &str,
        lookup: &dyn ScramUserLookup,
    ) -> Result<Self, SaslError> {
        let client_first = parse_client_first(message)?;
        if client_first.binding_name.is_some() && !channel_binding {
            return Err(SaslError::NotAuthorized(
                "channel binding was not offered".to_string(),
            ));
        }

        let user = lookup
            .user_by_username(&client_first.username)
            .map_err(|err| SaslError::TemporaryAuthFailure(err.to_string()))?;

        let client_nonce = client_first
            .bare
            .split(',')
            .find_map(|attr| attr.strip_prefix("r="))
            .unwrap_or_default()
            .to_string();
        let server_nonce = format!("{}-{}", client_nonce, Uuid::new_v4());
        let server_first = format!(
            "r={},s={},i={}",
            server_nonce,
            BASE64_STANDARD.encode(&user.salt),
            user.iterations
        );

        Ok(Self {
            client_first,
            user,
            server_nonce,
            server_first,
            _digest: PhantomData,
        })
    }

    pub(crate) fn username(&self) -> &str {
        &self.client_first.username
    }

    pub(crate) fn binding_name(&self) -> Option<&str> {
        self.client_first.binding_name.as_deref()
    }

    pub(crate) fn server_first(&self) -> &str {
        &self.server_first
    }

    /// Verifies the client proof and returns the server-final-message.
    pub(crate) fn verify_final(
        &self,
        message: &str,
        binding_data: &[u8],
    ) -> Result<String, SaslError> {
        let client_final = parse_client_final(message)?;

        if client_final.nonce != self.server_nonce {
            return Err(SaslError::NotAuthorized("nonce mismatch".to_string()));
        }

        let mut bind_input = self.client_first.gs2_header.as_bytes().to_vec();
        bind_input.extend_from_slice(binding_data);
        if client_final.channel_binding != BASE64_STANDARD.encode(&bind_input) {
            return Err(SaslError::NotAuthorized(
                "channel binding mismatch".to_string(),
            ));
        }

        let salted = self
            .user
            .salted_password(D::HASH_NAME)
            .map_err(|err| SaslError::TemporaryAuthFailure(err.to_string()))?;

        let client_key = hmac::<D>(salted, b"Client Key");
        let stored_key = D::digest(&client_key);
        let auth_message = format!(
            "{},{},{}",
            self.client_first.bare, self.server_first, client_final.without_proof
        );
        let client_signature = hmac::<D>(&stored_key, auth_message.as_bytes());

        let expected_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(key, signature)| key ^ signature)
            .collect();
        if expected_proof != client_final.proof {
            return Err(SaslError::NotAuthorized("proof mismatch".to_string()));
        }

        let server_key = hmac::<D>(salted, b"Server Key");
        let server_signature = hmac::<D>(&server_key, auth_message.as_bytes());
        Ok(format!("v={}", BASE64_STANDARD.encode(server_signature)))
    }
}

/// The SCRAM mechanism as registered with the SASL feature; `-PLUS`
/// variants are the same type with `channel_binding` set.
pub struct ScramAuth<D> {
    lookup: Arc<dyn ScramUserLookup>,
    channel_binding: bool,
    _digest: PhantomData<D>,
}

impl<D: ScramDigest> ScramAuth<D> {
    pub fn new(lookup: Arc<dyn ScramUserLookup>, channel_binding: bool) -> Self {
        Self {
            lookup,
            channel_binding,
            _digest: PhantomData,
        }
    }

    pub(super) async fn authenticate<C: Connection>(
        &self,
        initial: &str,
        channel: &mut Channel<C>,
    ) -> Result<String, SaslError> {
        let payload = auth_payload(initial)?;
        let client_first =
            String::from_utf8(payload).map_err(|_| SaslError::IncorrectEncoding)?;
        let exchange =
            ScramExchange::<D>::new(self.channel_binding, &client_first, self.lookup.as_ref())?;

        // The binding data must come from the transport before anything
        // else is written.
        let mut binding_data = Vec::new();
        if let Some(name) = exchange.binding_name() {
            if name != TLS_EXPORTER {
                return Err(SaslError::NotAuthorized(format!(
                    "unsupported channel binding `{name}`"
                )));
            }
            channel
                .bind_tls_unique(&mut binding_data)
                .map_err(|err| SaslError::NotAuthorized(err.to_string()))?;
        }

        let mut challenge = Element::new("challenge", Some(namespaces::XMPP_SASL));
        challenge.add_text(BASE64_STANDARD.encode(exchange.server_first()));
        channel.send_element(challenge).await.map_err(SaslError::from)?;

        let response = channel.next_element().await.map_err(SaslError::from)?;
        if response.validate("abort", Some(namespaces::XMPP_SASL)) {
            return Err(SaslError::Aborted);
        }
        if !response.validate("response", Some(namespaces::XMPP_SASL)) {
            return Err(SaslError::MalformedRequest(
                "expected a response element".to_string(),
            ));
        }
        let client_final = String::from_utf8(auth_payload(&response.text())?)
            .map_err(|_| SaslError::IncorrectEncoding)?;

        let server_final = exchange.verify_final(&client_final, &binding_data)?;

        let mut success = Element::new("success", Some(namespaces::XMPP_SASL));
        success.add_text(BASE64_STANDARD.encode(server_final));
        channel.send_element(success).await.map_err(SaslError::from)?;

        Ok(exchange.username().to_string())
    }
}
