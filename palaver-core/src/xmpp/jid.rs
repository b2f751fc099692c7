use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum JidError {
    #[error("incorrect jid encoding")]
    IncorrectJidEncoding,
}

/// An XMPP address: `local@domain/resource`, where only the domain is
/// mandatory. Equality is component-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(local: Option<&str>, domain: &str, resource: Option<&str>) -> Self {
        Self {
            local: local.map(|s| s.to_string()),
            domain: domain.to_string(),
            resource: resource.map(|s| s.to_string()),
        }
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn set_local(&mut self, local: &str) {
        self.local = Some(local.to_string());
    }

    pub fn set_resource(&mut self, resource: &str) {
        self.resource = Some(resource.to_string());
    }

    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_string()),
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (local, rest) = match s.split_once('@') {
            Some((local, rest)) => {
                if local.is_empty() {
                    return Err(JidError::IncorrectJidEncoding);
                }
                (Some(local.to_string()), rest)
            }
            None => (None, s),
        };

        let (domain, resource) = match rest.split_once('/') {
            Some((domain, resource)) => {
                if resource.is_empty() {
                    return Err(JidError::IncorrectJidEncoding);
                }
                (domain, Some(resource.to_string()))
            }
            None => (rest, None),
        };

        if domain.is_empty() || domain.contains('@') {
            return Err(JidError::IncorrectJidEncoding);
        }

        Ok(Jid {
            local,
            domain: domain.to_string(),
            resource,
        })
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_jid_round_trips() {
        let jid: Jid = "test@x.im/laptop".parse().unwrap();
        assert_eq!(jid.local(), Some("test"));
        assert_eq!(jid.domain(), "x.im");
        assert_eq!(jid.resource(), Some("laptop"));
        assert_eq!(jid.to_string().parse::<Jid>().unwrap(), jid);
    }

    #[test]
    fn bare_jid_round_trips() {
        let jid: Jid = "test@x.im".parse().unwrap();
        assert_eq!(jid.resource(), None);
        assert_eq!(jid.to_string(), "test@x.im");
        assert_eq!(jid.to_string().parse::<Jid>().unwrap(), jid);
    }

    #[test]
    fn domain_only_round_trips() {
        let jid: Jid = "x.im".parse().unwrap();
        assert_eq!(jid.local(), None);
        assert_eq!(jid.to_string(), "x.im");
        assert_eq!(jid.to_string().parse::<Jid>().unwrap(), jid);
    }

    #[test]
    fn domain_with_resource_round_trips() {
        let jid: Jid = "x.im/balcony".parse().unwrap();
        assert_eq!(jid.local(), None);
        assert_eq!(jid.resource(), Some("balcony"));
        assert_eq!(jid.to_string().parse::<Jid>().unwrap(), jid);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("".parse::<Jid>().is_err());
        assert!("@x.im".parse::<Jid>().is_err());
        assert!("test@".parse::<Jid>().is_err());
        assert!("test@x.im/".parse::<Jid>().is_err());
        assert!("a@b@c".parse::<Jid>().is_err());
    }

    #[test]
    fn bind_resource() {
        let jid: Jid = "test@x.im".parse().unwrap();
        let bound = jid.with_resource("laptop");
        assert_eq!(bound.to_string(), "test@x.im/laptop");
        assert_eq!(bound.to_bare(), jid);
    }
}
