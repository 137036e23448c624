use super::c14n::{canonicalize, canonicalize_authenticated};
use super::*;

fn c14n_str(xml: &str) -> String {
    let root = parse(xml).unwrap();
    String::from_utf8(canonicalize_authenticated(&root)).unwrap()
}

#[test]
fn test_inherited_namespaces_land_on_apex() {
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ebicsRequest xmlns="urn:org:ebics:H004" xmlns:ds="http://www.w3.org/2000/09/xmldsig#" Version="H004"><header authenticate="true"><static><HostID>EBIXQUAL</HostID></static><mutable/></header><body/></ebicsRequest>"#;
    assert_eq!(
        c14n_str(xml),
        r#"<header xmlns="urn:org:ebics:H004" xmlns:ds="http://www.w3.org/2000/09/xmldsig#" authenticate="true"><static><HostID>EBIXQUAL</HostID></static><mutable></mutable></header>"#
    );
}

#[test]
fn test_attributes_are_sorted_and_empty_elements_expanded() {
    let xml = r#"<a><b z="1" authenticate="true" c="2"><e/></b></a>"#;
    assert_eq!(c14n_str(xml), r#"<b authenticate="true" c="2" z="1"><e></e></b>"#);
}

#[test]
fn test_selected_subtrees_are_concatenated_in_document_order() {
    let xml = r#"<r><x authenticate="true"><y authenticate="true">1</y></x><z/><w authenticate="true">2</w></r>"#;
    assert_eq!(
        c14n_str(xml),
        r#"<x authenticate="true"><y authenticate="true">1</y></x><w authenticate="true">2</w>"#
    );
}

#[test]
fn test_redundant_declarations_are_dropped() {
    let xml = r#"<x xmlns="urn:u" authenticate="true"><y xmlns="urn:u"><z xmlns="urn:v"/></y></x>"#;
    assert_eq!(
        c14n_str(xml),
        r#"<x xmlns="urn:u" authenticate="true"><y><z xmlns="urn:v"></z></y></x>"#
    );
}

#[test]
fn test_text_and_attribute_escaping() {
    let xml = r#"<r authenticate="true" q="a&quot;b&#10;">a &amp; b &lt; c &gt; d &#65;</r>"#;
    assert_eq!(
        c14n_str(xml),
        r#"<r authenticate="true" q="a&quot;b&#xA;">a &amp; b &lt; c &gt; d A</r>"#
    );
}

#[test]
fn test_select_by_name() {
    let xml = r#"<AuthSignature xmlns="urn:org:ebics:H004" xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:SignedInfo><ds:CanonicalizationMethod Algorithm="x"/></ds:SignedInfo><ds:SignatureValue>v</ds:SignatureValue></AuthSignature>"#;
    let root = parse(xml).unwrap();
    let c14n = canonicalize(&root, |el| el.name == "SignedInfo");
    assert_eq!(
        String::from_utf8(c14n).unwrap(),
        r#"<ds:SignedInfo xmlns="urn:org:ebics:H004" xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:CanonicalizationMethod Algorithm="x"></ds:CanonicalizationMethod></ds:SignedInfo>"#
    );
}

#[test]
fn test_written_tree_canonicalizes_like_parsed_tree() {
    let built = Element::new("ebicsRequest")
        .with_namespace("", "urn:org:ebics:H004")
        .with_namespace("ds", "http://www.w3.org/2000/09/xmldsig#")
        .with_child(
            Element::new("header")
                .with_attr("authenticate", "true")
                .with_child(Element::text_element("Nonce", "A&B")),
        );
    let reparsed = parse(&built.to_document()).unwrap();
    assert_eq!(reparsed, built);
    assert_eq!(
        canonicalize_authenticated(&built),
        canonicalize_authenticated(&reparsed)
    );
}

#[test]
fn test_lookup_helpers() {
    let root = parse(
        r#"<r><header><static><TransactionID> ABC </TransactionID></static></header><body><ReturnCode>000000</ReturnCode></body></r>"#,
    )
    .unwrap();
    assert_eq!(
        root.text_at(&["header", "static", "TransactionID"]).as_deref(),
        Some("ABC")
    );
    assert_eq!(root.find("ReturnCode").unwrap().text(), "000000");
    assert!(root.find_path(&["header", "mutable"]).is_none());
}

#[test]
fn test_malformed_documents_are_rejected() {
    assert!(parse("<a><b></a>").is_err());
    assert!(parse("<a>").is_err());
    assert!(parse("<a/><b/>").is_err());
    assert!(parse("<a>&bogus;</a>").is_err());
}

#[test]
fn crlf_and_lf_documents_canonicalise_alike() {
    let lf = "<r>\n<x authenticate=\"true\" note=\"a\nb\">one\ntwo\n</x>\n</r>";
    let crlf = lf.replace('\n', "\r\n");
    let lone_cr = lf.replace('\n', "\r");
    assert_eq!(c14n_str(&crlf), c14n_str(lf));
    assert_eq!(c14n_str(&lone_cr), c14n_str(lf));
    assert_eq!(c14n_str(lf), "<x authenticate=\"true\" note=\"a b\">one\ntwo\n</x>");
}
