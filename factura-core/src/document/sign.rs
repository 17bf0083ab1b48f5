//! XAdES-BES enveloped signatures.
//!
//! Each signed reference is digested from its own canonical form:
//! the unsigned document, the standalone `KeyInfo` fragment and the standalone
//! `SignedProperties` fragment. `SignedInfo` is canonicalized on its own as well
//! before the RSA-SHA256 signature is computed.
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use libxml::{
    parser::Parser,
    tree::{Document, Node, c14n},
    xpath,
};
use openssl::{hash::MessageDigest, pkey::PKeyRef, pkey::Private, sign::Signer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use super::identifier::colombia_offset;
use super::xml::constants::{DS_NS, EXT_NS};
use super::xml::{
    self, ReferenceDigests, SignatureIds, SignedPropertiesValues, XmlError,
};
use crate::certificate::CertificateMaterial;

const EXTENSION_SLOTS_XPATH: &str = "//ext:UBLExtensions/ext:UBLExtension/ext:ExtensionContent";

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("XML error: {0}")]
    Xml(String),
    #[error("document has {found} extension slot(s), the signature goes into the second one")]
    MissingExtensionSlot { found: usize },
    #[error("document already carries a ds:Signature")]
    AlreadySigned,
    #[error("signature computation failed: {0}")]
    Crypto(String),
}

impl From<XmlError> for SigningError {
    fn from(err: XmlError) -> Self {
        SigningError::Xml(err.to_string())
    }
}

impl From<openssl::error::ErrorStack> for SigningError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        SigningError::Crypto(err.to_string())
    }
}

/// Per-call inputs that are not part of the certificate.
#[derive(Debug, Clone)]
pub struct SigningOptions {
    pub signing_time: DateTime<Utc>,
    /// Suffix of every `Id` in the signature block.
    pub signature_id: String,
}

impl SigningOptions {
    pub fn now() -> Self {
        Self {
            signing_time: Utc::now(),
            signature_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Signs UBL documents with borrowed certificate material.
///
/// The engine only borrows the key, so the material is released as soon as
/// the caller drops it.
///
/// # Examples
/// ```rust,no_run
/// use factura_core::certificate::CertificateStore;
/// use factura_core::document::sign::SignatureEngine;
///
/// let material = CertificateStore::load(&std::fs::read("signer.p12")?, "secret")?;
/// let unsigned = std::fs::read_to_string("invoice.xml")?;
/// let signed = SignatureEngine::new(&material).sign(&unsigned)?;
/// # let _ = signed;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct SignatureEngine<'a> {
    material: &'a CertificateMaterial,
}

impl<'a> SignatureEngine<'a> {
    pub fn new(material: &'a CertificateMaterial) -> Self {
        Self { material }
    }

    /// Sign `xml` now with a fresh signature id.
    ///
    /// # Errors
    /// Returns [`SigningError`] when the XML cannot be parsed, lacks a second
    /// extension slot, or the key cannot produce a signature.
    pub fn sign(&self, xml: &str) -> Result<String, SigningError> {
        self.sign_with(xml, &SigningOptions::now())
    }

    pub fn sign_with(&self, xml: &str, options: &SigningOptions) -> Result<String, SigningError> {
        let mut doc = Parser::default()
            .parse_string(xml)
            .map_err(|e| SigningError::Xml(format!("XML parse error: {e:?}")))?;

        let mut slot = signature_slot(&doc)?;
        let ids = SignatureIds::new(&options.signature_id);

        let document = digest_base64(&canonicalize_document(&doc)?);

        let key_info = xml::key_info(&ids, &self.material.certificate_base64());
        let key_info_digest = digest_base64(&canonicalize_fragment(&key_info.to_xml()?)?);

        let signing_time = options
            .signing_time
            .with_timezone(&colombia_offset())
            .format("%Y-%m-%dT%H:%M:%S%:z")
            .to_string();
        let cert_digest = self.material.digest_base64();
        let signed_properties = xml::signed_properties(
            &ids,
            &SignedPropertiesValues {
                signing_time: &signing_time,
                cert_digest_b64: &cert_digest,
                issuer: self.material.issuer(),
                serial: self.material.serial_number(),
            },
        );
        let signed_properties_digest =
            digest_base64(&canonicalize_fragment(&signed_properties.to_xml()?)?);

        let digests = ReferenceDigests {
            document,
            key_info: key_info_digest,
            signed_properties: signed_properties_digest,
        };
        tracing::debug!(
            signature_id = %options.signature_id,
            document_digest = %digests.document,
            key_info_digest = %digests.key_info,
            signed_properties_digest = %digests.signed_properties,
            "computed reference digests"
        );

        let signed_info = xml::signed_info(&ids, &digests);
        let canonical_signed_info = canonicalize_fragment(&signed_info.to_xml()?)?;
        let signature_value = rsa_sha256_base64(
            self.material.private_key(),
            canonical_signed_info.as_bytes(),
        )?;

        let signature = xml::signature(
            &ids,
            signed_info,
            &signature_value,
            key_info,
            signed_properties,
        )
        .to_xml()?;
        let mut signature_node = import_fragment(&mut doc, &signature)?;
        slot.add_child(&mut signature_node)
            .map_err(|e| SigningError::Xml(e.to_string()))?;

        Ok(doc.to_string())
    }
}

/// C14N 1.0 (no comments) of a whole document.
///
/// # Errors
/// Returns [`SigningError::Xml`] when libxml cannot canonicalize the tree.
pub fn canonicalize_document(doc: &Document) -> Result<String, SigningError> {
    let canon_opts = c14n::CanonicalizationOptions {
        mode: c14n::CanonicalizationMode::Canonical1_0,
        inclusive_ns_prefixes: vec![],
        with_comments: false,
    };
    doc.canonicalize(canon_opts, None)
        .map_err(|e| SigningError::Xml(format!("Failed to canonicalize xml: {e:?}")))
}

/// Canonical form of an XML fragment parsed as its own document.
pub fn canonicalize_fragment(fragment: &str) -> Result<String, SigningError> {
    let doc = Parser::default()
        .parse_string(fragment)
        .map_err(|e| SigningError::Xml(format!("XML parse error: {e:?}")))?;
    canonicalize_document(&doc)
}

/// Base64 SHA-256 of canonical text, as written into `ds:DigestValue`.
pub fn digest_base64(canonical: &str) -> String {
    Base64::encode_string(&Sha256::digest(canonical.as_bytes()))
}

fn rsa_sha256_base64(key: &PKeyRef<Private>, data: &[u8]) -> Result<String, SigningError> {
    let mut signer = Signer::new(MessageDigest::sha256(), key)?;
    signer.update(data)?;
    Ok(Base64::encode_string(&signer.sign_to_vec()?))
}

fn signature_slot(doc: &Document) -> Result<Node, SigningError> {
    let ctx = xpath::Context::new(doc)
        .map_err(|e| SigningError::Xml(format!("XPath context error: {e:?}")))?;
    ctx.register_namespace("ext", EXT_NS)
        .map_err(|e| SigningError::Xml(format!("XPath context error: {e:?}")))?;
    ctx.register_namespace("ds", DS_NS)
        .map_err(|e| SigningError::Xml(format!("XPath context error: {e:?}")))?;

    let existing = ctx
        .evaluate("//ds:Signature")
        .map_err(|e| SigningError::Xml(format!("XPath context error: {e:?}")))?
        .get_nodes_as_vec();
    if !existing.is_empty() {
        return Err(SigningError::AlreadySigned);
    }

    let slots = ctx
        .evaluate(EXTENSION_SLOTS_XPATH)
        .map_err(|e| SigningError::Xml(format!("XPath context error: {e:?}")))?
        .get_nodes_as_vec();
    let found = slots.len();
    slots
        .into_iter()
        .nth(1)
        .ok_or(SigningError::MissingExtensionSlot { found })
}

fn import_fragment(doc: &mut Document, xml: &str) -> Result<Node, SigningError> {
    let fragment = Parser::default()
        .parse_string(xml)
        .map_err(|e| SigningError::Xml(format!("XML parse error: {e:?}")))?;
    let mut node = fragment
        .get_root_element()
        .ok_or_else(|| SigningError::Xml("missing fragment root".into()))?;
    node.unlink();
    doc.import_node(&mut node)
        .map_err(|_| SigningError::Xml("failed to import fragment".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_INFO: &str = r#"<ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#" Id="k"><ds:X509Data><ds:X509Certificate>MIIB</ds:X509Certificate></ds:X509Data></ds:KeyInfo>"#;

    #[test]
    fn fragment_digest_ignores_attribute_order_and_tag_whitespace() {
        let reordered = r#"<ds:KeyInfo   Id="k"
            xmlns:ds="http://www.w3.org/2000/09/xmldsig#" ><ds:X509Data ><ds:X509Certificate>MIIB</ds:X509Certificate></ds:X509Data></ds:KeyInfo >"#;
        assert_eq!(
            digest_base64(&canonicalize_fragment(KEY_INFO).expect("canonical")),
            digest_base64(&canonicalize_fragment(reordered).expect("canonical"))
        );
    }

    #[test]
    fn fragment_digest_ignores_empty_element_style() {
        let short = r#"<ds:SignedInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:CanonicalizationMethod Algorithm="a"/></ds:SignedInfo>"#;
        let long = r#"<?xml version="1.0"?><ds:SignedInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:CanonicalizationMethod Algorithm='a'></ds:CanonicalizationMethod></ds:SignedInfo>"#;
        assert_eq!(
            canonicalize_fragment(short).expect("short"),
            canonicalize_fragment(long).expect("long")
        );
    }

    #[test]
    fn fragment_digest_changes_with_content() {
        let altered = KEY_INFO.replace("MIIB", "MIIC");
        assert_ne!(
            digest_base64(&canonicalize_fragment(KEY_INFO).expect("canonical")),
            digest_base64(&canonicalize_fragment(&altered).expect("canonical"))
        );
    }

    #[test]
    fn fragment_canonical_form_is_independent_of_document_context() {
        let embedded = format!(
            r#"<Invoice xmlns="urn:oasis:names:specification:ubl:schema:xsd:Invoice-2" xmlns:cbc="urn:cbc">{KEY_INFO}</Invoice>"#
        );
        let doc = Parser::default().parse_string(&embedded).expect("parse");
        let whole = canonicalize_document(&doc).expect("document");
        let standalone = canonicalize_fragment(KEY_INFO).expect("fragment");
        assert!(whole.contains("urn:cbc"));
        assert!(!standalone.contains("urn:cbc"));
        assert!(!standalone.contains("Invoice-2"));
        assert_eq!(
            standalone,
            canonicalize_fragment(KEY_INFO).expect("fragment again")
        );
    }

    #[test]
    fn slot_lookup_requires_two_extension_contents() {
        let one_slot = r#"<Invoice xmlns="urn:oasis:names:specification:ubl:schema:xsd:Invoice-2" xmlns:ext="urn:oasis:names:specification:ubl:schema:xsd:CommonExtensionComponents-2"><ext:UBLExtensions><ext:UBLExtension><ext:ExtensionContent/></ext:UBLExtension></ext:UBLExtensions></Invoice>"#;
        let doc = Parser::default().parse_string(one_slot).expect("parse");
        assert!(matches!(
            signature_slot(&doc),
            Err(SigningError::MissingExtensionSlot { found: 1 })
        ));

        let two_slots = one_slot.replace(
            "</ext:UBLExtensions>",
            "<ext:UBLExtension><ext:ExtensionContent/></ext:UBLExtension></ext:UBLExtensions>",
        );
        let doc = Parser::default().parse_string(&two_slots).expect("parse");
        assert!(signature_slot(&doc).is_ok());
    }

    #[test]
    fn canonical_document_drops_declaration_and_comments() {
        let doc = Parser::default()
            .parse_string("<?xml version=\"1.0\"?><a><!-- note --><b x='1'/></a>")
            .expect("parse");
        assert_eq!(
            canonicalize_document(&doc).expect("canonical"),
            "<a><b x=\"1\"></b></a>"
        );
    }
}
