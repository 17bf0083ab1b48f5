//! XML serialization for signature fragments and UBL documents.
use quick_xml::se::{SeError, Serializer as QuickXmlSerializer};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

pub(crate) mod constants;
pub mod template;

use constants::{
    C14N_ALGORITHM, CLAIMED_ROLE, DS_NS, ENVELOPED_TRANSFORM, RSA_SHA256_ALGORITHM,
    SHA256_ALGORITHM, SIGNATURE_POLICY_DESCRIPTION, SIGNATURE_POLICY_HASH, SIGNATURE_POLICY_ID,
    SIGNED_PROPERTIES_TYPE, XADES_NS,
};

/// XML serialization error.
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("failed to serialize XML: {source}")]
    Serialize {
        #[from]
        source: SeError,
    },
}

/// Small element tree written through quick-xml's serde serializer.
///
/// Attribute names carry quick-xml's `@` marker, e.g. `"@Id"`.
#[derive(Debug, Clone)]
pub(crate) struct Element {
    tag: &'static str,
    attributes: Vec<(&'static str, String)>,
    content: Content,
}

#[derive(Debug, Clone)]
enum Content {
    Empty,
    Text(String),
    Children(Vec<Element>),
}

impl Element {
    pub(crate) fn new(tag: &'static str) -> Self {
        Self {
            tag,
            attributes: Vec::new(),
            content: Content::Empty,
        }
    }

    pub(crate) fn attr(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.attributes.push((name, value.into()));
        self
    }

    pub(crate) fn text(mut self, value: impl Into<String>) -> Self {
        self.content = Content::Text(value.into());
        self
    }

    pub(crate) fn child(mut self, child: Element) -> Self {
        match &mut self.content {
            Content::Children(children) => children.push(child),
            _ => self.content = Content::Children(vec![child]),
        }
        self
    }

    pub(crate) fn children(self, children: impl IntoIterator<Item = Element>) -> Self {
        children.into_iter().fold(self, Element::child)
    }

    /// Shorthand for `<tag>text</tag>`.
    pub(crate) fn leaf(tag: &'static str, value: impl Into<String>) -> Self {
        Element::new(tag).text(value)
    }

    pub(crate) fn to_xml(&self) -> Result<String, XmlError> {
        let mut buffer = String::with_capacity(1024);
        let serializer = QuickXmlSerializer::new(&mut buffer);
        self.serialize(serializer)?;
        Ok(buffer)
    }
}

impl Serialize for Element {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut st = s.serialize_struct(self.tag, self.attributes.len() + 1)?;
        for (name, value) in &self.attributes {
            st.serialize_field(*name, value)?;
        }
        match &self.content {
            Content::Empty => {}
            Content::Text(text) => st.serialize_field("$text", text)?,
            Content::Children(children) => {
                for child in children {
                    st.serialize_field(child.tag, child)?;
                }
            }
        }
        st.end()
    }
}

/// `Id` values tying the signature parts together.
#[derive(Debug, Clone)]
pub(crate) struct SignatureIds {
    base: String,
}

impl SignatureIds {
    pub(crate) fn new(base: &str) -> Self {
        Self {
            base: format!("xmldsig-{base}"),
        }
    }

    pub(crate) fn signature(&self) -> String {
        self.base.clone()
    }

    pub(crate) fn document_reference(&self) -> String {
        format!("{}-ref0", self.base)
    }

    pub(crate) fn key_info(&self) -> String {
        format!("{}-keyinfo", self.base)
    }

    pub(crate) fn signed_properties(&self) -> String {
        format!("{}-signedprops", self.base)
    }

    pub(crate) fn signature_value(&self) -> String {
        format!("{}-sigvalue", self.base)
    }
}

fn algorithm(tag: &'static str, uri: &str) -> Element {
    Element::new(tag).attr("@Algorithm", uri)
}

pub(crate) fn key_info(ids: &SignatureIds, certificate_b64: &str) -> Element {
    Element::new("ds:KeyInfo")
        .attr("@xmlns:ds", DS_NS)
        .attr("@Id", ids.key_info())
        .child(
            Element::new("ds:X509Data").child(Element::leaf("ds:X509Certificate", certificate_b64)),
        )
}

pub(crate) struct SignedPropertiesValues<'a> {
    pub(crate) signing_time: &'a str,
    pub(crate) cert_digest_b64: &'a str,
    pub(crate) issuer: &'a str,
    pub(crate) serial: &'a str,
}

pub(crate) fn signed_properties(ids: &SignatureIds, values: &SignedPropertiesValues<'_>) -> Element {
    let signing_certificate = Element::new("xades:SigningCertificate").child(
        Element::new("xades:Cert")
            .child(
                Element::new("xades:CertDigest")
                    .child(algorithm("ds:DigestMethod", SHA256_ALGORITHM))
                    .child(Element::leaf("ds:DigestValue", values.cert_digest_b64)),
            )
            .child(
                Element::new("xades:IssuerSerial")
                    .child(Element::leaf("ds:X509IssuerName", values.issuer))
                    .child(Element::leaf("ds:X509SerialNumber", values.serial)),
            ),
    );
    let policy = Element::new("xades:SignaturePolicyIdentifier").child(
        Element::new("xades:SignaturePolicyId")
            .child(
                Element::new("xades:SigPolicyId")
                    .child(Element::leaf("xades:Identifier", SIGNATURE_POLICY_ID))
                    .child(Element::leaf("xades:Description", SIGNATURE_POLICY_DESCRIPTION)),
            )
            .child(
                Element::new("xades:SigPolicyHash")
                    .child(algorithm("ds:DigestMethod", SHA256_ALGORITHM))
                    .child(Element::leaf("ds:DigestValue", SIGNATURE_POLICY_HASH)),
            ),
    );
    let role = Element::new("xades:SignerRole").child(
        Element::new("xades:ClaimedRoles").child(Element::leaf("xades:ClaimedRole", CLAIMED_ROLE)),
    );

    Element::new("xades:SignedProperties")
        .attr("@xmlns:xades", XADES_NS)
        .attr("@xmlns:ds", DS_NS)
        .attr("@Id", ids.signed_properties())
        .child(
            Element::new("xades:SignedSignatureProperties")
                .child(Element::leaf("xades:SigningTime", values.signing_time))
                .child(signing_certificate)
                .child(policy)
                .child(role),
        )
}

/// Digests of the three signed references, base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDigests {
    pub document: String,
    pub key_info: String,
    pub signed_properties: String,
}

pub(crate) fn signed_info(ids: &SignatureIds, digests: &ReferenceDigests) -> Element {
    let document_reference = Element::new("ds:Reference")
        .attr("@Id", ids.document_reference())
        .attr("@URI", "")
        .child(
            Element::new("ds:Transforms").child(algorithm("ds:Transform", ENVELOPED_TRANSFORM)),
        )
        .child(algorithm("ds:DigestMethod", SHA256_ALGORITHM))
        .child(Element::leaf("ds:DigestValue", &digests.document));
    let key_info_reference = Element::new("ds:Reference")
        .attr("@URI", format!("#{}", ids.key_info()))
        .child(algorithm("ds:DigestMethod", SHA256_ALGORITHM))
        .child(Element::leaf("ds:DigestValue", &digests.key_info));
    let signed_properties_reference = Element::new("ds:Reference")
        .attr("@Type", SIGNED_PROPERTIES_TYPE)
        .attr("@URI", format!("#{}", ids.signed_properties()))
        .child(algorithm("ds:DigestMethod", SHA256_ALGORITHM))
        .child(Element::leaf("ds:DigestValue", &digests.signed_properties));

    Element::new("ds:SignedInfo")
        .attr("@xmlns:ds", DS_NS)
        .child(algorithm("ds:CanonicalizationMethod", C14N_ALGORITHM))
        .child(algorithm("ds:SignatureMethod", RSA_SHA256_ALGORITHM))
        .child(document_reference)
        .child(key_info_reference)
        .child(signed_properties_reference)
}

pub(crate) fn signature(
    ids: &SignatureIds,
    signed_info: Element,
    signature_value: &str,
    key_info: Element,
    signed_properties: Element,
) -> Element {
    Element::new("ds:Signature")
        .attr("@xmlns:ds", DS_NS)
        .attr("@Id", ids.signature())
        .child(signed_info)
        .child(
            Element::leaf("ds:SignatureValue", signature_value)
                .attr("@Id", ids.signature_value()),
        )
        .child(key_info)
        .child(
            Element::new("ds:Object").child(
                Element::new("xades:QualifyingProperties")
                    .attr("@xmlns:xades", XADES_NS)
                    .attr("@Target", format!("#{}", ids.signature()))
                    .child(signed_properties),
            ),
        )
}
