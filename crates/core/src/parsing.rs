use crate::error::{EinvError, EinvResult};
use sha2::{Digest, Sha256};
use std::borrow::Cow;

pub fn compute_sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let bytes = hasher.finalize();
    hex::encode(bytes)
}

/// Escapes text for inclusion in an XML element or attribute.
pub fn xml_escape(raw: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(raw)
}

pub fn parse_document(xml: &str) -> EinvResult<roxmltree::Document<'_>> {
    roxmltree::Document::parse(xml)
        .map_err(|e| EinvError::MalformedResponse(format!("invalid XML: {e}")))
}

/// Walks element children by local name, ignoring namespaces.
pub fn find_element<'a, 'input: 'a>(
    node: roxmltree::Node<'a, 'input>,
    path: &[&str],
) -> Option<roxmltree::Node<'a, 'input>> {
    if path.is_empty() {
        return Some(node);
    }
    for child in node.children() {
        if child.is_element() && child.tag_name().name() == path[0] {
            if path.len() == 1 {
                return Some(child);
            }
            if let Some(found) = find_element(child, &path[1..]) {
                return Some(found);
            }
        }
    }
    None
}

/// First descendant (or the node itself) with the given local name.
pub fn find_descendant<'a, 'input: 'a>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

/// Trimmed, non-empty text of the element at `path` below `node`.
pub fn text_at_path(node: roxmltree::Node<'_, '_>, path: &[&str]) -> Option<String> {
    find_element(node, path)
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Child elements of `node` with the given local name.
pub fn children_named<'a, 'input: 'a>(
    node: roxmltree::Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> + 'a {
    node.children()
        .filter(move |c| c.is_element() && c.tag_name().name() == name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    pub code: String,
    pub message: String,
}

/// Body element of a SOAP 1.1 envelope.
pub fn soap_body<'a, 'input: 'a>(
    doc: &'a roxmltree::Document<'input>,
) -> EinvResult<roxmltree::Node<'a, 'input>> {
    let root = doc.root_element();
    if root.tag_name().name() != "Envelope" {
        return Err(EinvError::MalformedResponse(format!(
            "expected SOAP Envelope, found <{}>",
            root.tag_name().name()
        )));
    }
    find_element(root, &["Body"])
        .ok_or_else(|| EinvError::MalformedResponse("SOAP envelope without Body".to_string()))
}

/// Extracts a SOAP fault from the envelope body, if the body carries one.
pub fn soap_fault(body: roxmltree::Node<'_, '_>) -> Option<SoapFault> {
    let fault = find_element(body, &["Fault"])?;
    let code = text_at_path(fault, &["faultcode"]).unwrap_or_else(|| "unknown".to_string());
    let message = text_at_path(fault, &["faultstring"]).unwrap_or_default();
    Some(SoapFault { code, message })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAULT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
  <soapenv:Body>
    <soapenv:Fault>
      <faultcode xmlns:ns1="http://xml.apache.org/axis/">ns1:cms.cert.expired</faultcode>
      <faultstring>Certificado expirado</faultstring>
    </soapenv:Fault>
  </soapenv:Body>
</soapenv:Envelope>"#;

    #[test]
    fn detects_soap_fault() {
        let doc = parse_document(FAULT).unwrap();
        let body = soap_body(&doc).unwrap();
        let fault = soap_fault(body).unwrap();
        assert_eq!(fault.code, "ns1:cms.cert.expired");
        assert_eq!(fault.message, "Certificado expirado");
    }

    #[test]
    fn rejects_non_envelope_documents() {
        let doc = parse_document("<html><body/></html>").unwrap();
        assert!(matches!(
            soap_body(&doc),
            Err(EinvError::MalformedResponse(_))
        ));
    }

    #[test]
    fn text_lookup_ignores_namespaces_and_blank_text() {
        let doc = parse_document(r#"<a xmlns:x="urn:x"><x:b><x:c> 41 </x:c><d>  </d></x:b></a>"#)
            .unwrap();
        let root = doc.root_element();
        assert_eq!(text_at_path(root, &["b", "c"]).as_deref(), Some("41"));
        assert_eq!(text_at_path(root, &["b", "d"]), None);
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(xml_escape("A & B <x>"), "A &amp; B &lt;x&gt;");
    }
}
