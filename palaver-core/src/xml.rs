pub mod namespaces;
pub mod serializer;
pub mod stream_codec;

type AttrName = (String, Option<String>);

#[derive(Debug, Clone)]
enum Node {
    Element(Element),
    Text(String),
}

/// An XML tree as exchanged over an XMPP stream: a name, an optional
/// namespace, attributes keyed by `(name, namespace)` and ordered children.
///
/// Attribute order is not semantically significant but is preserved so that
/// serialization round-trips the way the element was built.
#[derive(Debug, Clone, Default)]
pub struct Element {
    name: String,
    namespace: Option<String>,
    attributes: Vec<(AttrName, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str, namespace: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn validate(&self, name: &str, namespace: Option<&str>) -> bool {
        self.name == name && self.namespace.as_deref() == namespace
    }

    /// Matches by local name only. Stanza dispatch keys off the local name
    /// because the same stanza vocabulary appears under `jabber:client` and
    /// `jabber:server` default namespaces.
    pub fn is_named(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn attribute(&self, name: &str, namespace: Option<&str>) -> Option<&str> {
        self.attributes
            .iter()
            .find(|((n, ns), _)| n == name && ns.as_deref() == namespace)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attribute(&mut self, name: &str, namespace: Option<&str>, value: impl Into<String>) {
        let value = value.into();
        for ((n, ns), v) in &mut self.attributes {
            if n == name && ns.as_deref() == namespace {
                *v = value;
                return;
            }
        }
        self.attributes
            .push(((name.to_string(), namespace.map(|s| s.to_string())), value));
    }

    pub fn find_child(&self, name: &str, namespace: Option<&str>) -> Option<&Element> {
        self.child_elements()
            .find(|child| child.validate(name, namespace))
    }

    /// First child element with the given local name, any namespace.
    pub fn find_child_named(&self, name: &str) -> Option<&Element> {
        self.child_elements().find(|child| child.is_named(name))
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    pub fn text(&self) -> String {
        let mut text = String::new();
        for child in &self.children {
            match child {
                Node::Element(element) => text.push_str(&element.text()),
                Node::Text(s) => text.push_str(s),
            }
        }
        text
    }

    pub fn add_child(&mut self, element: Element) {
        self.children.push(Node::Element(element));
    }

    pub fn with_child<F>(&mut self, name: &str, namespace: Option<&str>, f: F)
    where
        F: FnOnce(&mut Element),
    {
        let mut element = Element::new(name, namespace);
        f(&mut element);
        self.children.push(Node::Element(element));
    }

    pub fn add_text(&mut self, text: impl Into<String>) {
        self.children.push(Node::Text(text.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_simple() {
        let element = Element::new("foo", Some("bar"));
        assert!(element.validate("foo", Some("bar")));
    }

    #[test]
    fn validate_different_name() {
        let element = Element::new("foo", Some("bar"));
        assert!(!element.validate("baz", Some("bar")));
    }

    #[test]
    fn validate_different_namespace() {
        let element = Element::new("foo", Some("bar"));
        assert!(!element.validate("foo", Some("baz")));
    }

    #[test]
    fn attribute_simple() {
        let mut element = Element::new("foo", Some("bar"));
        element.set_attribute("baz", None, "qux");
        assert_eq!(element.attribute("baz", None), Some("qux"));
    }

    #[test]
    fn attribute_missing() {
        let element = Element::new("foo", Some("bar"));
        assert_eq!(element.attribute("baz", None), None);
    }

    #[test]
    fn attribute_overwrite_keeps_position() {
        let mut element = Element::new("foo", Some("bar"));
        element.set_attribute("baz", None, "qux");
        element.set_attribute("quux", None, "corge");
        element.set_attribute("baz", None, "overwritten");
        assert_eq!(element.attribute("baz", None), Some("overwritten"));
        assert_eq!(element.attributes[0].0.0, "baz");
    }

    #[test]
    fn child_lookup() {
        let mut parent = Element::new("foo", Some("bar"));
        parent.add_child(Element::new("baz", Some("qux")));
        parent.add_child(Element::new("quux", Some("qux")));
        assert!(parent.find_child("quux", Some("qux")).is_some());
        assert!(parent.find_child("quux", Some("other")).is_none());
        assert!(parent.find_child_named("baz").is_some());
    }

    #[test]
    fn child_helper() {
        let mut parent = Element::new("foo", Some("bar"));
        parent.with_child("baz", Some("qux"), |child| {
            child.set_attribute("quux", None, "corge");
        });
        assert_eq!(
            parent
                .find_child("baz", Some("qux"))
                .unwrap()
                .attribute("quux", None),
            Some("corge")
        );
    }

    #[test]
    fn text_nested() {
        let mut parent = Element::new("foo", Some("bar"));
        parent.add_text("before");
        parent.with_child("baz", Some("qux"), |child| {
            child.add_text("inside");
        });
        parent.add_text("after");
        assert_eq!(parent.text(), "beforeinsideafter");
    }

    #[test]
    fn child_elements_skips_text() {
        let mut parent = Element::new("foo", None);
        parent.add_text("text");
        parent.add_child(Element::new("bar", None));
        assert_eq!(parent.child_elements().count(), 1);
    }
}
