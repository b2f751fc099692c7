use std::collections::HashMap;

use super::{Element, Node, namespaces};

pub const XML_DECLARATION: &str = "<?xml version='1.0'?>";

/// Serializes elements to their wire form.
///
/// Namespace scopes are stacked: an opening tag written with
/// [`XmlSerializer::opening_tag`] (the stream header) leaves its namespace
/// declarations in scope for every element serialized afterwards, mirroring
/// how stanzas nest inside the unclosed stream root for the lifetime of the
/// stream.
pub struct XmlSerializer {
    namespaces: Vec<HashMap<String, String>>, // stacked namespace to prefix map
}

impl XmlSerializer {
    pub fn new() -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(namespaces::XML.to_string(), "xml".to_string());
        namespaces.insert(namespaces::XMLNS.to_string(), "xmlns".to_string());

        Self {
            namespaces: vec![namespaces],
        }
    }

    /// Serializes a complete element, self-closing when childless.
    pub fn element(&mut self, element: &Element) -> String {
        let mut xml = String::new();
        self.build_element(element, &mut xml);
        xml
    }

    /// Serializes an opening tag whose namespace declarations stay in scope.
    pub fn opening_tag(&mut self, element: &Element) -> String {
        let mut xml = String::new();
        self.build_opening_tag(element, false, &mut xml);
        xml
    }

    fn build_element(&mut self, element: &Element, xml: &mut String) {
        if element.children.is_empty() {
            self.build_opening_tag(element, true, xml);
        } else {
            self.build_opening_tag(element, false, xml);
            self.build_children(element, xml);
            self.build_closing_tag(element, xml);
        }
    }

    fn lookup_prefix(&self, namespace: &str) -> Option<&str> {
        for scope in self.namespaces.iter().rev() {
            if let Some(prefix) = scope.get(namespace) {
                return Some(prefix);
            }
        }
        None
    }

    fn build_opening_tag(&mut self, element: &Element, self_closing: bool, xml: &mut String) {
        // Collect the namespace declarations this element carries.
        let mut scope = HashMap::new();
        for ((attribute, namespace), value) in &element.attributes {
            match namespace {
                Some(namespace) if namespace == namespaces::XMLNS => {
                    scope.insert(value.clone(), attribute.clone());
                }
                None if attribute == "xmlns" => {
                    scope.insert(value.clone(), String::new());
                }
                _ => {}
            }
        }

        // An element in a namespace nothing in scope declares gets a default
        // xmlns declaration of its own.
        let mut implicit_xmlns = None;
        if let Some(namespace) = &element.namespace {
            if self.lookup_prefix(namespace).is_none() && !scope.contains_key(namespace) {
                scope.insert(namespace.clone(), String::new());
                implicit_xmlns = Some(namespace.clone());
            }
        }
        self.namespaces.push(scope);

        xml.push('<');
        xml.push_str(&self.qualified_name(element));
        if let Some(namespace) = implicit_xmlns {
            xml.push_str(&format!(" xmlns='{}'", escape_attr(&namespace)));
        }
        self.build_attributes(element, xml);

        if self_closing {
            self.namespaces.pop();
            xml.push_str("/>");
        } else {
            xml.push('>');
        }
    }

    fn qualified_name(&self, element: &Element) -> String {
        match &element.namespace {
            Some(namespace) => match self.lookup_prefix(namespace) {
                Some("") | None => element.name.clone(),
                Some(prefix) => format!("{}:{}", prefix, element.name),
            },
            None => element.name.clone(),
        }
    }

    fn build_attributes(&self, element: &Element, xml: &mut String) {
        for ((attribute, namespace), value) in &element.attributes {
            match namespace {
                Some(namespace) => {
                    let prefix = self
                        .lookup_prefix(namespace)
                        .filter(|prefix| !prefix.is_empty());
                    match prefix {
                        Some(prefix) => {
                            xml.push_str(&format!(
                                " {}:{}='{}'",
                                prefix,
                                attribute,
                                escape_attr(value)
                            ));
                        }
                        None => {
                            debug_assert!(false, "attribute namespace not declared");
                        }
                    }
                }
                None => {
                    xml.push_str(&format!(" {}='{}'", attribute, escape_attr(value)));
                }
            }
        }
    }

    fn build_children(&mut self, element: &Element, xml: &mut String) {
        for child in &element.children {
            match child {
                Node::Element(child_element) => self.build_element(child_element, xml),
                Node::Text(text) => xml.push_str(&escape_text(text)),
            }
        }
    }

    fn build_closing_tag(&mut self, element: &Element, xml: &mut String) {
        xml.push_str(&format!("</{}>", self.qualified_name(element)));
        self.namespaces.pop();
    }
}

impl Default for XmlSerializer {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    escape_text(value).replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn childless_element_self_closes() {
        let element = Element::new("proceed", Some(namespaces::XMPP_STARTTLS));
        let xml = XmlSerializer::new().element(&element);
        assert_eq!(
            xml,
            "<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"
        );
    }

    #[test]
    fn namespace_declared_once_for_subtree() {
        let mut mechanisms = Element::new("mechanisms", Some(namespaces::XMPP_SASL));
        mechanisms.with_child("mechanism", Some(namespaces::XMPP_SASL), |mechanism| {
            mechanism.add_text("PLAIN");
        });
        let xml = XmlSerializer::new().element(&mechanisms);
        assert_eq!(
            xml,
            "<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>"
        );
    }

    #[test]
    fn header_scope_persists_for_later_elements() {
        let mut serializer = XmlSerializer::new();

        let mut header = Element::new("stream", Some(namespaces::XMPP_STREAMS));
        header.set_attribute("xmlns", None, namespaces::XMPP_CLIENT);
        header.set_attribute("stream", Some(namespaces::XMLNS), namespaces::XMPP_STREAMS);
        let opening = serializer.opening_tag(&header);
        assert_eq!(
            opening,
            "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>"
        );

        let features = Element::new("features", Some(namespaces::XMPP_STREAMS));
        assert_eq!(serializer.element(&features), "<stream:features/>");

        let iq = Element::new("iq", Some(namespaces::XMPP_CLIENT));
        assert_eq!(serializer.element(&iq), "<iq/>");
    }

    #[test]
    fn attribute_values_are_escaped() {
        let mut message = Element::new("message", None);
        message.set_attribute("to", None, "o'brien@x.im");
        message.add_text("1 < 2 & 3");
        let xml = XmlSerializer::new().element(&message);
        assert_eq!(
            xml,
            "<message to='o&apos;brien@x.im'>1 &lt; 2 &amp; 3</message>"
        );
    }

    #[test]
    fn xml_lang_uses_predeclared_prefix() {
        let mut element = Element::new("text", None);
        element.set_attribute("lang", Some(namespaces::XML), "en");
        let xml = XmlSerializer::new().element(&element);
        assert_eq!(xml, "<text xml:lang='en'/>");
    }
}
