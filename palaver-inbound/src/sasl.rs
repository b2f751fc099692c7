use std::sync::Arc;

use anyhow::{Error, bail};
use base64::prelude::*;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use tracing::debug;

use palaver_core::auth::{Authorized, PlainUserLookup, ScramUserLookup};
use palaver_core::xml::{Element, namespaces};
use palaver_core::xmpp::jid::Jid;
use palaver_core::xmpp::part::SessionHandle;
use palaver_core::xmpp::stanza::Failure;
use palaver_core::xmpp::stream::{Channel, Connection, StreamError};
use palaver_core::xmpp::stream_header::PartAttr;

use self::plain::PlainAuth;
use self::scram::ScramAuth;

pub mod plain;
pub mod scram;

pub const PLAIN: &str = "PLAIN";
pub const SCRAM_SHA_1: &str = "SCRAM-SHA-1";
pub const SCRAM_SHA_1_PLUS: &str = "SCRAM-SHA-1-PLUS";
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
pub const SCRAM_SHA_256_PLUS: &str = "SCRAM-SHA-256-PLUS";
pub const SCRAM_SHA_512: &str = "SCRAM-SHA-512";
pub const SCRAM_SHA_512_PLUS: &str = "SCRAM-SHA-512-PLUS";

/// The RFC 6120 §6.5 SASL failure conditions. Each renders as
/// `<failure xmlns='…sasl'><CONDITION/><text xml:lang='en'>…</text></failure>`.
#[derive(Debug, thiserror::Error)]
pub enum SaslError {
    #[error("aborted")]
    Aborted,
    #[error("account disabled")]
    AccountDisabled,
    #[error("credentials expired")]
    CredentialsExpired,
    #[error("encryption required")]
    EncryptionRequired,
    #[error("incorrect encoding")]
    IncorrectEncoding,
    #[error("invalid authzid")]
    InvalidAuthzid,
    #[error("invalid mechanism: {0}")]
    InvalidMechanism(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("mechanism too weak")]
    MechanismTooWeak,
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("temporary auth failure: {0}")]
    TemporaryAuthFailure(String),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl SaslError {
    pub fn condition(&self) -> Option<&'static str> {
        match self {
            SaslError::Aborted => Some("aborted"),
            SaslError::AccountDisabled => Some("account-disabled"),
            SaslError::CredentialsExpired => Some("credentials-expired"),
            SaslError::EncryptionRequired => Some("encryption-required"),
            SaslError::IncorrectEncoding => Some("incorrect-encoding"),
            SaslError::InvalidAuthzid => Some("invalid-authzid"),
            SaslError::InvalidMechanism(_) => Some("invalid-mechanism"),
            SaslError::MalformedRequest(_) => Some("malformed-request"),
            SaslError::MechanismTooWeak => Some("mechanism-too-weak"),
            SaslError::NotAuthorized(_) => Some("not-authorized"),
            SaslError::TemporaryAuthFailure(_) => Some("temporary-auth-failure"),
            SaslError::Stream(_) => None,
        }
    }

    pub fn to_failure(&self) -> Option<Failure> {
        self.condition().map(|condition| {
            Failure::new(namespaces::XMPP_SASL, condition).with_text(&self.to_string(), "en")
        })
    }
}

/// Decodes a base64 SASL payload as the mechanisms expect it.
pub(crate) fn auth_payload(encoded: &str) -> Result<Vec<u8>, SaslError> {
    if encoded.is_empty() {
        return Err(SaslError::IncorrectEncoding);
    }
    BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|_| SaslError::IncorrectEncoding)
}

/// A registered authentication mechanism. The set is closed over what the
/// stream core can run; the hosting application picks which names to
/// register and with which credential lookups.
pub enum Mechanism {
    Plain(PlainAuth),
    ScramSha1(ScramAuth<Sha1>),
    ScramSha256(ScramAuth<Sha256>),
    ScramSha512(ScramAuth<Sha512>),
}

impl Mechanism {
    pub fn plain(lookup: Arc<dyn PlainUserLookup>) -> Self {
        Mechanism::Plain(PlainAuth::new(lookup))
    }

    pub fn scram_sha1(lookup: Arc<dyn ScramUserLookup>, channel_binding: bool) -> Self {
        Mechanism::ScramSha1(ScramAuth::new(lookup, channel_binding))
    }

    pub fn scram_sha256(lookup: Arc<dyn ScramUserLookup>, channel_binding: bool) -> Self {
        Mechanism::ScramSha256(ScramAuth::new(lookup, channel_binding))
    }

    pub fn scram_sha512(lookup: Arc<dyn ScramUserLookup>, channel_binding: bool) -> Self {
        Mechanism::ScramSha512(ScramAuth::new(lookup, channel_binding))
    }

    async fn authenticate<C: Connection>(
        &self,
        initial: &str,
        channel: &mut Channel<C>,
    ) -> Result<String, SaslError> {
        match self {
            Mechanism::Plain(auth) => auth.authenticate(initial, channel).await,
            Mechanism::ScramSha1(auth) => auth.authenticate(initial, channel).await,
            Mechanism::ScramSha256(auth) => auth.authenticate(initial, channel).await,
            Mechanism::ScramSha512(auth) => auth.authenticate(initial, channel).await,
        }
    }
}

/// The SASL stream feature: advertises the registered mechanism names,
/// runs the selected mechanism's exchange, and reports the authenticated
/// identity exactly once.
pub struct SaslFeature {
    mechanisms: Vec<(String, Mechanism)>,
    authorized: Arc<dyn Authorized>,
    handled: bool,
}

impl SaslFeature {
    pub fn new(authorized: Arc<dyn Authorized>) -> Self {
        Self {
            mechanisms: Vec::new(),
            authorized,
            handled: false,
        }
    }

    pub fn support(&mut self, name: &str, mechanism: Mechanism) -> &mut Self {
        self.mechanisms.push((name.to_string(), mechanism));
        self
    }

    pub fn handled(&self) -> bool {
        self.handled
    }

    pub fn advertisement(&self) -> Element {
        let mut mechanisms = Element::new("mechanisms", Some(namespaces::XMPP_SASL));
        for (name, _) in &self.mechanisms {
            mechanisms.with_child("mechanism", Some(namespaces::XMPP_SASL), |mechanism| {
                mechanism.add_text(name.clone());
            });
        }
        mechanisms
    }

    pub fn matches(&self, element: &Element) -> bool {
        element.validate("auth", Some(namespaces::XMPP_SASL))
    }

    pub async fn handle<C: Connection>(
        &mut self,
        element: &Element,
        attr: &mut PartAttr,
        channel: &mut Channel<C>,
        session: &SessionHandle,
    ) -> Result<(), Error> {
        self.handled = true;

        let chosen = element.attribute("mechanism", None).unwrap_or_default();
        let Some((_, mechanism)) = self
            .mechanisms
            .iter()
            .find(|(name, _)| name.as_str() == chosen)
        else {
            let supported: Vec<&str> = self
                .mechanisms
                .iter()
                .map(|(name, _)| name.as_str())
                .collect();
            let err = SaslError::InvalidMechanism(format!(
                "only [{}] are supported here, client prefers [{}]",
                supported.join(","),
                chosen
            ));
            self.send_failure(channel, &err).await?;
            bail!(err);
        };

        match mechanism.authenticate(&element.text(), channel).await {
            Ok(username) => {
                debug!("authenticated as {username}");
                let jid = Jid::new(Some(&username), &attr.domain, None);
                attr.jid = Some(jid.clone());
                self.authorized.authorized(&jid, session);
                Ok(())
            }
            Err(err) => {
                self.send_failure(channel, &err).await?;
                bail!(err);
            }
        }
    }

    async fn send_failure<C: Connection>(
        &self,
        channel: &mut Channel<C>,
        err: &SaslError,
    ) -> Result<(), Error> {
        // Transport-level errors skip the wire step.
        if let Some(failure) = err.to_failure() {
            channel.send_element(failure.to_element()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::auth::UserLookupError;
    use palaver_core::auth::{PlainUser, ScramUser};

    struct NoUsers;

    impl PlainUserLookup for NoUsers {
        fn user_by_username(&self, _username: &str) -> Result<PlainUser, UserLookupError> {
            Err(UserLookupError::NotFound)
        }
    }

    impl ScramUserLookup for NoUsers {
        fn user_by_username(&self, _username: &str) -> Result<ScramUser, UserLookupError> {
            Err(UserLookupError::NotFound)
        }
    }

    struct Nobody;
    impl Authorized for Nobody {
        fn authorized(&self, _jid: &Jid, _session: &SessionHandle) {}
    }

    #[test]
    fn advertisement_lists_mechanisms_in_registration_order() {
        let mut feature = SaslFeature::new(Arc::new(Nobody));
        feature.support(SCRAM_SHA_1, Mechanism::scram_sha1(Arc::new(NoUsers), false));
        feature.support(PLAIN, Mechanism::plain(Arc::new(NoUsers)));

        let ad = feature.advertisement();
        assert!(ad.validate("mechanisms", Some(namespaces::XMPP_SASL)));
        let names: Vec<String> = ad.child_elements().map(|m| m.text()).collect();
        assert_eq!(names, vec!["SCRAM-SHA-1", "PLAIN"]);
    }

    #[test]
    fn matches_auth_element_only() {
        let feature = SaslFeature::new(Arc::new(Nobody));
        let auth = Element::new("auth", Some(namespaces::XMPP_SASL));
        assert!(feature.matches(&auth));
        let other = Element::new("auth", Some(namespaces::XMPP_BIND));
        assert!(!feature.matches(&other));
    }

    #[test]
    fn payload_decoding_rejects_bad_base64() {
        assert!(matches!(
            auth_payload("@@not-base64@@"),
            Err(SaslError::IncorrectEncoding)
        ));
        assert!(matches!(auth_payload(""), Err(SaslError::IncorrectEncoding)));
        assert_eq!(auth_payload("AHRlc3QAMTIzNDU2").unwrap(), b"\0test\0123456");
    }

    #[test]
    fn failure_elements_carry_condition_and_text() {
        let err = SaslError::InvalidMechanism("DIGEST-MD5".to_string());
        let failure = err.to_failure().unwrap();
        let element = failure.to_element();
        assert!(element.validate("failure", Some(namespaces::XMPP_SASL)));
        assert!(element.find_child("invalid-mechanism", Some(namespaces::XMPP_SASL)).is_some());
        assert!(element.find_child_named("text").is_some());
    }

    #[test]
    fn transport_errors_have_no_wire_form() {
        let err = SaslError::Stream(StreamError::Closed);
        assert!(err.to_failure().is_none());
    }
}
