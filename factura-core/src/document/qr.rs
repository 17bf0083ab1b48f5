//! Verification string embedded as the document's QR payload.
use super::amounts::format_amount;
use super::identifier::{DocumentIdentifier, IdentifierInput};
use crate::config::EnvironmentType;

/// URL of the public DIAN catalogue page for a document.
pub fn verification_url(env: EnvironmentType, identifier: &DocumentIdentifier) -> String {
    format!(
        "{}/document/searchqr?documentkey={}",
        env.verification_host(),
        identifier
    )
}

/// Build the plain-text `key: value` payload scanned from printed documents.
///
/// # Examples
/// ```rust,ignore
/// let payload = verification_payload(&input, &generate(&input));
/// assert!(payload.starts_with("NumFac: SETP990000001\n"));
/// ```
pub fn verification_payload(input: &IdentifierInput, identifier: &DocumentIdentifier) -> String {
    let totals = &input.totals;
    let other_taxes = totals.inc + totals.ica;
    let lines = [
        ("NumFac", input.number.clone()),
        ("FecFac", input.issue_date()),
        ("HorFac", input.issue_time()),
        ("NitFac", input.issuer_nit.clone()),
        ("DocAdq", input.counterpart_id.clone()),
        ("ValFac", format_amount(totals.subtotal)),
        ("ValIva", format_amount(totals.iva)),
        ("ValOtroIm", format_amount(other_taxes)),
        ("ValTolFac", format_amount(totals.total)),
        (input.scheme.as_str(), identifier.to_string()),
        ("QRCode", verification_url(input.environment, identifier)),
    ];
    lines
        .iter()
        .map(|(key, value)| format!("{key}: {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}
