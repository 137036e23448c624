//! A small owned XML tree on top of the `xmlparser` tokenizer.
//!
//! EBICS documents are small, so requests are built as trees, signed over their
//! canonical form and written out in one go. Responses are parsed into the same
//! tree and queried by local name, since every EBICS version uses its own
//! namespace for otherwise identical element names.

pub mod c14n;

#[cfg(test)]
mod test_c14n;

use std::borrow::Cow;

use xmlparser::{ElementEnd, Token, Tokenizer};

use crate::error::{EbicsError, Result};

pub const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub prefix: Option<String>,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub prefix: Option<String>,
    pub name: String,
    /// Namespace declarations made on this element, `""` standing for the default namespace.
    pub namespaces: Vec<(String, String)>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Element {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn prefixed(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Element {
            prefix: Some(prefix.into()),
            name: name.into(),
            ..Default::default()
        }
    }

    /// `ds:`-prefixed element of the XML signature namespace.
    pub fn ds(name: impl Into<String>) -> Self {
        Element::prefixed("ds", name)
    }

    pub fn with_namespace(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.namespaces.push((prefix.into(), uri.into()));
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_opt_child(self, child: Option<Element>) -> Self {
        match child {
            Some(child) => self.with_child(child),
            None => self,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    /// Shorthand for `<name>text</name>`.
    pub fn text_element(name: impl Into<String>, text: impl Into<String>) -> Self {
        Element::new(name).with_text(text)
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .attributes
            .iter_mut()
            .find(|a| a.prefix.is_none() && a.name == name)
        {
            Some(existing) => existing.value = value,
            None => self.attributes.push(Attribute {
                prefix: None,
                name,
                value,
            }),
        }
    }

    pub fn qname(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, self.name),
            None => self.name.clone(),
        }
    }

    /// Value of an unprefixed attribute.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.prefix.is_none() && a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Namespace URI declared on this element for `prefix` (`""` for the default).
    pub fn declared_namespace(&self, prefix: &str) -> Option<&str> {
        self.namespaces
            .iter()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First direct child with the given local name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|el| el.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.elements_mut().find(|el| el.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements().filter(move |el| el.name == name)
    }

    /// Walks a chain of direct children by local name.
    pub fn find_path(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |el, name| el.child(name))
    }

    /// First descendant (depth first, document order) with the given local name.
    pub fn find(&self, name: &str) -> Option<&Element> {
        for el in self.elements() {
            if el.name == name {
                return Some(el);
            }
            if let Some(found) = el.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Trimmed text of the element at `path`, if it exists and is non-empty.
    pub fn text_at(&self, path: &[&str]) -> Option<String> {
        self.find_path(path)
            .map(|el| el.text().trim().to_string())
            .filter(|text| !text.is_empty())
    }

    /// Inserts `element` directly after the first child called `sibling`.
    pub fn insert_after(&mut self, sibling: &str, element: Element) -> Result<()> {
        let position = self
            .children
            .iter()
            .position(|node| matches!(node, Node::Element(el) if el.name == sibling))
            .ok_or_else(|| {
                EbicsError::Xml(format!("<{}> has no <{}> child", self.name, sibling))
            })?;
        self.children.insert(position + 1, Node::Element(element));
        Ok(())
    }

    /// Serialises the element as a complete document.
    pub fn to_document(&self) -> String {
        let mut out = String::from(XML_DECLARATION);
        out.push('\n');
        self.write(&mut out);
        out
    }

    pub fn write(&self, out: &mut String) {
        let qname = self.qname();
        out.push('<');
        out.push_str(&qname);
        for (prefix, uri) in &self.namespaces {
            if prefix.is_empty() {
                out.push_str(" xmlns=\"");
            } else {
                out.push_str(" xmlns:");
                out.push_str(prefix);
                out.push_str("=\"");
            }
            out.push_str(&escape_attr(uri));
            out.push('"');
        }
        for attr in &self.attributes {
            out.push(' ');
            if let Some(prefix) = &attr.prefix {
                out.push_str(prefix);
                out.push(':');
            }
            out.push_str(&attr.name);
            out.push_str("=\"");
            out.push_str(&escape_attr(&attr.value));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(el) => el.write(out),
                Node::Text(text) => out.push_str(&escape_text(text)),
            }
        }
        out.push_str("</");
        out.push_str(&qname);
        out.push('>');
    }
}

/// Parses a complete document into its root element.
///
/// Line breaks are normalised to `\n` first (XML 1.0, 2.11), so CRLF input
/// canonicalises to the same bytes as its LF form.
pub fn parse(xml: &str) -> Result<Element> {
    let xml = normalize_line_endings(xml);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    for token in Tokenizer::from(&*xml) {
        let token = token.map_err(|e| EbicsError::Xml(e.to_string()))?;
        match token {
            Token::ElementStart { prefix, local, .. } => {
                let prefix = match prefix.as_str() {
                    "" => None,
                    p => Some(p.to_string()),
                };
                stack.push(Element {
                    prefix,
                    name: local.to_string(),
                    ..Default::default()
                });
            }
            Token::Attribute {
                prefix,
                local,
                value,
                ..
            } => {
                let current = stack
                    .last_mut()
                    .ok_or_else(|| EbicsError::Xml("attribute outside of an element".into()))?;
                let value = unescape(&normalize_attr(value.as_str()))?;
                match (prefix.as_str(), local.as_str()) {
                    ("", "xmlns") => current.namespaces.push((String::new(), value)),
                    ("xmlns", name) => current.namespaces.push((name.to_string(), value)),
                    ("", name) => current.attributes.push(Attribute {
                        prefix: None,
                        name: name.to_string(),
                        value,
                    }),
                    (p, name) => current.attributes.push(Attribute {
                        prefix: Some(p.to_string()),
                        name: name.to_string(),
                        value,
                    }),
                }
            }
            Token::ElementEnd { end, .. } => match end {
                ElementEnd::Open => {}
                ElementEnd::Empty => close_element(&mut stack, &mut root)?,
                ElementEnd::Close(prefix, local) => {
                    let open = stack
                        .last()
                        .ok_or_else(|| EbicsError::Xml(format!("unexpected </{}>", local)))?;
                    if open.name != local.as_str()
                        || open.prefix.as_deref().unwrap_or("") != prefix.as_str()
                    {
                        return Err(EbicsError::Xml(format!(
                            "mismatched closing tag </{}>, expected </{}>",
                            local,
                            open.qname()
                        )));
                    }
                    close_element(&mut stack, &mut root)?;
                }
            },
            Token::Text { text } => match stack.last_mut() {
                Some(current) => append_text(current, unescape(text.as_str())?),
                None if text.as_str().trim().is_empty() => {}
                None => return Err(EbicsError::Xml("text outside of the root element".into())),
            },
            Token::Cdata { text, .. } => {
                if let Some(current) = stack.last_mut() {
                    append_text(current, text.to_string());
                }
            }
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(EbicsError::Xml("document ended inside an element".into()));
    }
    root.ok_or_else(|| EbicsError::Xml("document has no root element".into()))
}

fn close_element(stack: &mut Vec<Element>, root: &mut Option<Element>) -> Result<()> {
    let element = stack
        .pop()
        .ok_or_else(|| EbicsError::Xml("closing tag without open element".into()))?;
    match stack.last_mut() {
        Some(parent) => parent.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(EbicsError::Xml("document has more than one root element".into())),
    }
    Ok(())
}

fn append_text(element: &mut Element, text: String) {
    if let Some(Node::Text(previous)) = element.children.last_mut() {
        previous.push_str(&text);
    } else {
        element.children.push(Node::Text(text));
    }
}

// Literal whitespace in attribute values is normalised to blanks before entity expansion.
fn normalize_line_endings(xml: &str) -> Cow<'_, str> {
    if xml.contains('\r') {
        Cow::Owned(xml.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(xml)
    }
}

fn normalize_attr(raw: &str) -> String {
    raw.replace(['\t', '\n'], " ")
}

fn unescape(raw: &str) -> Result<String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let end = rest[start..]
            .find(';')
            .ok_or_else(|| EbicsError::Xml("unterminated entity reference".into()))?;
        let entity = &rest[start + 1..start + end];
        match entity {
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "amp" => out.push('&'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                let ch = code.and_then(char::from_u32).ok_or_else(|| {
                    EbicsError::Xml(format!("unknown entity reference &{};", entity))
                })?;
                out.push(ch);
            }
        }
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

pub(crate) fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
    out
}

pub(crate) fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
    out
}
