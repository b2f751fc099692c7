//! Contracts the stream core consumes from its hosting application:
//! credential lookups for the SASL mechanisms, the authorized-session
//! callback and the resource binder.

use std::collections::HashMap;

use crate::xmpp::jid::Jid;
use crate::xmpp::part::SessionHandle;

#[derive(Debug, thiserror::Error)]
pub enum UserLookupError {
    #[error("user not found")]
    NotFound,
    #[error("hash `{0}` not supported")]
    HashNotSupported(String),
    #[error("lookup failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone)]
pub struct PlainUser {
    pub username: String,
    pub password: String,
}

pub trait PlainUserLookup: Send + Sync {
    fn user_by_username(&self, username: &str) -> Result<PlainUser, UserLookupError>;
}

/// SCRAM credentials as stored: the salt and iteration count handed to the
/// client, and the PBKDF2-salted password per hash function. The plaintext
/// never reaches the mechanism.
#[derive(Debug, Clone)]
pub struct ScramUser {
    pub id: String,
    pub username: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
    salted_passwords: HashMap<String, Vec<u8>>,
}

impl ScramUser {
    pub fn new(id: &str, username: &str, salt: Vec<u8>, iterations: u32) -> Self {
        Self {
            id: id.to_string(),
            username: username.to_string(),
            salt,
            iterations,
            salted_passwords: HashMap::new(),
        }
    }

    pub fn add_salted_password(&mut self, hash_name: &str, salted: Vec<u8>) {
        self.salted_passwords.insert(hash_name.to_string(), salted);
    }

    pub fn salted_password(&self, hash_name: &str) -> Result<&[u8], UserLookupError> {
        self.salted_passwords
            .get(hash_name)
            .map(|salted| salted.as_slice())
            .ok_or_else(|| UserLookupError::HashNotSupported(hash_name.to_string()))
    }
}

pub trait ScramUserLookup: Send + Sync {
    fn user_by_username(&self, username: &str) -> Result<ScramUser, UserLookupError>;
}

/// Called exactly once per successful SASL exchange, with the stream's
/// authenticated bare JID. Implementations typically index the session for
/// stanza routing.
pub trait Authorized: Send + Sync {
    fn authorized(&self, jid: &Jid, session: &SessionHandle);
}

#[derive(Debug, thiserror::Error)]
pub enum BindRequestError {
    #[error("resource constraint")]
    ResourceConstraint,
    #[error("not allowed")]
    NotAllowed,
}

impl BindRequestError {
    /// The `type` attribute of the resulting error stanza.
    pub fn error_type(&self) -> &'static str {
        match self {
            BindRequestError::ResourceConstraint => "wait",
            BindRequestError::NotAllowed => "cancel",
        }
    }

    /// The defined-condition child of the resulting error stanza.
    pub fn condition(&self) -> &'static str {
        match self {
            BindRequestError::ResourceConstraint => "resource-constraint",
            BindRequestError::NotAllowed => "not-allowed",
        }
    }
}

pub trait ResourceBinder: Send + Sync {
    /// Binds the requested resource for the authenticated `jid`, returning
    /// the resulting full JID.
    fn bind_resource(
        &self,
        jid: &Jid,
        resource: &str,
        session: &SessionHandle,
    ) -> Result<Jid, BindRequestError>;
}
