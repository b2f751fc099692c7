use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::xml::{Element, namespaces};

#[derive(Debug, thiserror::Error)]
pub enum StanzaError {
    #[error("not a stanza `{0}` element")]
    NotStanza(&'static str),
    #[error("`{0}` is not a valid stanza type")]
    InvalidType(String),
    #[error("parsed element is not the required failure")]
    NotFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaName {
    Iq,
    Message,
    Presence,
}

impl StanzaName {
    pub fn as_str(self) -> &'static str {
        match self {
            StanzaName::Iq => "iq",
            StanzaName::Message => "message",
            StanzaName::Presence => "presence",
        }
    }
}

/// IQ semantics require one of exactly four types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl FromStr for IqType {
    type Err = StanzaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(IqType::Get),
            "set" => Ok(IqType::Set),
            "result" => Ok(IqType::Result),
            "error" => Ok(IqType::Error),
            other => Err(StanzaError::InvalidType(other.to_string())),
        }
    }
}

impl Display for IqType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// The routing tuple of a top-level stanza. Children are carried by the
/// element itself; this captures what routing and reply construction need.
#[derive(Debug, Clone, Default)]
pub struct Stanza {
    pub name: String,
    pub stanza_type: Option<String>,
    pub id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl Stanza {
    pub fn from_element(element: &Element, name: StanzaName) -> Result<Self, StanzaError> {
        if !element.is_named(name.as_str()) {
            return Err(StanzaError::NotStanza(name.as_str()));
        }
        let stanza_type = element.attribute("type", None).map(|s| s.to_string());
        if name == StanzaName::Iq {
            match &stanza_type {
                Some(t) => {
                    t.parse::<IqType>()?;
                }
                None => return Err(StanzaError::InvalidType(String::new())),
            }
        }
        Ok(Stanza {
            name: name.as_str().to_string(),
            stanza_type,
            id: element.attribute("id", None).map(|s| s.to_string()),
            from: element.attribute("from", None).map(|s| s.to_string()),
            to: element.attribute("to", None).map(|s| s.to_string()),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut element = Element::new(&self.name, None);
        if let Some(stanza_type) = &self.stanza_type {
            element.set_attribute("type", None, stanza_type.clone());
        }
        if let Some(id) = &self.id {
            element.set_attribute("id", None, id.clone());
        }
        if let Some(from) = &self.from {
            element.set_attribute("from", None, from.clone());
        }
        if let Some(to) = &self.to {
            element.set_attribute("to", None, to.clone());
        }
        element
    }

    pub fn iq_type(&self) -> Option<IqType> {
        self.stanza_type.as_deref().and_then(|t| t.parse().ok())
    }
}

/// The `<error type='…'><condition xmlns='…stanzas'/></error>` child of an
/// error stanza.
#[derive(Debug, Clone)]
pub struct StanzaErrorElem {
    pub error_type: String,
    pub condition: String,
}

impl StanzaErrorElem {
    pub fn to_element(&self) -> Element {
        let mut error = Element::new("error", None);
        error.set_attribute("type", None, self.error_type.clone());
        error.add_child(Element::new(
            &self.condition,
            Some(namespaces::XMPP_STANZAS),
        ));
        error
    }

    pub fn from_element(element: &Element) -> Option<Self> {
        let error = element.find_child_named("error")?;
        let condition = error.child_elements().next()?;
        Some(StanzaErrorElem {
            error_type: error.attribute("type", None).unwrap_or_default().to_string(),
            condition: condition.name().to_string(),
        })
    }
}

/// The wire form of a negotiation failure. Every feature uses the same
/// encoding with its own namespace.
#[derive(Debug, Clone)]
pub struct Failure {
    pub namespace: String,
    pub condition: String,
    pub text: Option<String>,
    pub text_lang: Option<String>,
}

impl Failure {
    pub fn new(namespace: &str, condition: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            condition: condition.to_string(),
            text: None,
            text_lang: None,
        }
    }

    pub fn with_text(mut self, text: &str, lang: &str) -> Self {
        self.text = Some(text.to_string());
        self.text_lang = Some(lang.to_string());
        self
    }

    pub fn from_element(element: &Element, namespace: &str) -> Result<Self, StanzaError> {
        if !element.validate("failure", Some(namespace)) {
            return Err(StanzaError::NotFailure);
        }
        let mut children = element.child_elements();
        let condition = children.next().ok_or(StanzaError::NotFailure)?;
        let text = children.next();
        Ok(Failure {
            namespace: namespace.to_string(),
            condition: condition.name().to_string(),
            text: text.map(|t| t.text()),
            text_lang: text
                .and_then(|t| t.attribute("lang", Some(namespaces::XML)))
                .map(|s| s.to_string()),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut failure = Element::new("failure", Some(&self.namespace));
        failure.add_child(Element::new(&self.condition, Some(&self.namespace)));
        if let Some(text) = &self.text {
            failure.with_child("text", Some(&self.namespace), |t| {
                if let Some(lang) = &self.text_lang {
                    t.set_attribute("lang", Some(namespaces::XML), lang.clone());
                }
                t.add_text(text.clone());
            });
        }
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iq_round_trips() {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None, "set");
        element.set_attribute("id", None, "bind_1");
        element.set_attribute("from", None, "test@x.im");

        let stanza = Stanza::from_element(&element, StanzaName::Iq).unwrap();
        assert_eq!(stanza.iq_type(), Some(IqType::Set));
        assert_eq!(stanza.id.as_deref(), Some("bind_1"));

        let rebuilt = stanza.to_element();
        assert_eq!(rebuilt.attribute("type", None), Some("set"));
        assert_eq!(rebuilt.attribute("id", None), Some("bind_1"));
        assert_eq!(rebuilt.attribute("from", None), Some("test@x.im"));
        assert_eq!(rebuilt.attribute("to", None), None);
    }

    #[test]
    fn iq_type_is_validated() {
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None, "subscribe");
        assert!(matches!(
            Stanza::from_element(&element, StanzaName::Iq),
            Err(StanzaError::InvalidType(_))
        ));
    }

    #[test]
    fn iq_without_type_is_rejected() {
        let element = Element::new("iq", None);
        assert!(Stanza::from_element(&element, StanzaName::Iq).is_err());
    }

    #[test]
    fn message_type_is_free_form() {
        let mut element = Element::new("message", None);
        element.set_attribute("type", None, "chat");
        let stanza = Stanza::from_element(&element, StanzaName::Message).unwrap();
        assert_eq!(stanza.stanza_type.as_deref(), Some("chat"));
    }

    #[test]
    fn wrong_name_is_rejected() {
        let element = Element::new("message", None);
        assert!(matches!(
            Stanza::from_element(&element, StanzaName::Iq),
            Err(StanzaError::NotStanza("iq"))
        ));
    }

    #[test]
    fn failure_round_trips() {
        let failure = Failure::new(namespaces::XMPP_SASL, "invalid-mechanism")
            .with_text("mechanism unknown", "en");
        let element = failure.to_element();
        let parsed = Failure::from_element(&element, namespaces::XMPP_SASL).unwrap();
        assert_eq!(parsed.condition, "invalid-mechanism");
        assert_eq!(parsed.text.as_deref(), Some("mechanism unknown"));
        assert_eq!(parsed.text_lang.as_deref(), Some("en"));
    }

    #[test]
    fn failure_namespace_is_checked() {
        let failure = Failure::new(namespaces::XMPP_SASL, "aborted");
        let element = failure.to_element();
        assert!(Failure::from_element(&element, namespaces::COMPRESS).is_err());
    }
}
