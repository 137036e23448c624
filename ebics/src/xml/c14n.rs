//! Canonical XML 1.0 (inclusive, without comments) of selected subtrees.
//!
//! Only the document-subset form EBICS needs is covered: every outermost element
//! accepted by the selector is rendered together with its whole subtree, and the
//! results are concatenated in document order.

use std::collections::BTreeMap;

use super::{escape_attr, escape_text, Element, Node};

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

type Scope = BTreeMap<String, String>;

/// Canonicalizes every outermost element matching `select`.
pub fn canonicalize<F>(root: &Element, select: F) -> Vec<u8>
where
    F: Fn(&Element) -> bool,
{
    let mut out = String::new();
    walk(root, &Scope::new(), &select, &mut out);
    out.into_bytes()
}

/// Canonical form of the elements flagged `authenticate="true"`.
pub fn canonicalize_authenticated(root: &Element) -> Vec<u8> {
    canonicalize(root, |el| el.attr("authenticate") == Some("true"))
}

fn walk<F>(element: &Element, inherited: &Scope, select: &F, out: &mut String)
where
    F: Fn(&Element) -> bool,
{
    let scope = extend_scope(inherited, element);
    if select(element) {
        render(element, &scope, &Scope::new(), out);
        return;
    }
    for child in element.elements() {
        walk(child, &scope, select, out);
    }
}

fn extend_scope(inherited: &Scope, element: &Element) -> Scope {
    let mut scope = inherited.clone();
    for (prefix, uri) in &element.namespaces {
        scope.insert(prefix.clone(), uri.clone());
    }
    scope
}

/// `scope` holds the namespaces in scope at `element`, `rendered` those already
/// emitted by output ancestors.
fn render(element: &Element, scope: &Scope, rendered: &Scope, out: &mut String) {
    let qname = element.qname();
    out.push('<');
    out.push_str(&qname);

    // BTreeMap order puts the default namespace ("") before every prefix.
    for (prefix, uri) in scope {
        if rendered.get(prefix) == Some(uri) {
            continue;
        }
        if prefix.is_empty() {
            if uri.is_empty() && rendered.get(prefix).map_or(true, |r| r.is_empty()) {
                continue;
            }
            out.push_str(" xmlns=\"");
        } else {
            if uri.is_empty() {
                continue;
            }
            out.push_str(" xmlns:");
            out.push_str(prefix);
            out.push_str("=\"");
        }
        out.push_str(&escape_attr(uri));
        out.push('"');
    }

    let mut attributes: Vec<(&str, String, &str)> = element
        .attributes
        .iter()
        .map(|attr| {
            let uri = match attr.prefix.as_deref() {
                None => "",
                Some("xml") => XML_NAMESPACE,
                Some(prefix) => scope.get(prefix).map(String::as_str).unwrap_or(""),
            };
            let name = match &attr.prefix {
                Some(prefix) => format!("{}:{}", prefix, attr.name),
                None => attr.name.clone(),
            };
            (uri, name, attr.value.as_str())
        })
        .collect();
    attributes.sort_by(|a, b| {
        let local_a = a.1.rsplit(':').next().unwrap_or(&a.1);
        let local_b = b.1.rsplit(':').next().unwrap_or(&b.1);
        (a.0, local_a).cmp(&(b.0, local_b))
    });
    for (_, name, value) in attributes {
        out.push(' ');
        out.push_str(&name);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }
    out.push('>');

    for child in &element.children {
        match child {
            Node::Text(text) => out.push_str(&escape_text(text)),
            Node::Element(el) => {
                let child_scope = extend_scope(scope, el);
                render(el, &child_scope, scope, out);
            }
        }
    }

    out.push_str("</");
    out.push_str(&qname);
    out.push('>');
}
