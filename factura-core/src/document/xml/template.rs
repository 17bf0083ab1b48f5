//! UBL 2.1 rendering of invoices and notes with the DIAN extension block.
use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;

use super::constants::{
    CAC_NS, CBC_NS, CREDIT_NOTE_NS, DEBIT_NOTE_NS, DIAN_NIT, EXT_NS, INVOICE_NS, STS_NS,
};
use super::{Element, XmlError};
use crate::document::DocumentType;
use crate::document::amounts::{DocumentTotals, PricedLine, TaxKind, format_amount};
use crate::document::identifier::{DocumentIdentifier, software_security_code};
use crate::source::Counterparty;
use crate::tenant::TenantFiscalConfig;

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";
const CURRENCY: &str = "COP";
const UNIT_CODE: &str = "94";
const DIAN_AGENCY_ID: &str = "195";
const DIAN_AGENCY_NAME: &str = "CO, DIAN (Dirección de Impuestos y Aduanas Nacionales)";
const NIT_SCHEME: &str = "31";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error(transparent)]
    Xml(#[from] XmlError),
    #[error("tenant has no {0} configured")]
    MissingConfig(&'static str),
    #[error("{0} requires a billing reference")]
    MissingReference(DocumentType),
}

/// Invoice a note refers back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingReference {
    pub number: String,
    pub identifier: String,
    pub issue_date: NaiveDate,
}

/// Why a note was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discrepancy {
    pub concept: String,
    pub description: String,
}

/// Everything needed to render one unsigned document.
#[derive(Debug, Clone)]
pub struct TemplateRequest<'a> {
    pub config: &'a TenantFiscalConfig,
    pub document_type: DocumentType,
    pub number: &'a str,
    pub identifier: &'a DocumentIdentifier,
    pub issue_date: &'a str,
    pub issue_time: &'a str,
    pub qr_payload: &'a str,
    pub customer: &'a Counterparty,
    pub lines: &'a [PricedLine],
    pub totals: &'a DocumentTotals,
    pub billing_reference: Option<&'a BillingReference>,
    pub discrepancy: Option<&'a Discrepancy>,
}

/// Produces unsigned UBL XML with two `UBLExtension` slots, the second empty.
pub trait DocumentTemplater: Send + Sync {
    fn render(&self, request: &TemplateRequest<'_>) -> Result<String, TemplateError>;
}

/// Built-in templater for DIAN UBL 2.1.
#[derive(Debug, Clone, Copy, Default)]
pub struct UblTemplater;

impl DocumentTemplater for UblTemplater {
    fn render(&self, request: &TemplateRequest<'_>) -> Result<String, TemplateError> {
        let kind = request.document_type;
        let env_code = request.config.environment.identifier_code();
        let scheme_name = kind.identifier_scheme().scheme_name();

        let mut root = document_root(kind)
            .child(extensions(request)?)
            .child(Element::leaf("cbc:UBLVersionID", "UBL 2.1"))
            .child(Element::leaf(
                "cbc:CustomizationID",
                if kind.is_note() { "20" } else { "10" },
            ))
            .child(Element::leaf("cbc:ProfileID", profile_id(kind)))
            .child(Element::leaf("cbc:ProfileExecutionID", env_code))
            .child(Element::leaf("cbc:ID", request.number))
            .child(
                Element::leaf("cbc:UUID", request.identifier.as_str())
                    .attr("@schemeID", env_code)
                    .attr("@schemeName", scheme_name),
            )
            .child(Element::leaf("cbc:IssueDate", request.issue_date))
            .child(Element::leaf("cbc:IssueTime", request.issue_time));

        root = match kind {
            DocumentType::Invoice => root.child(Element::leaf("cbc:InvoiceTypeCode", "01")),
            DocumentType::CreditNote => root.child(Element::leaf("cbc:CreditNoteTypeCode", "91")),
            DocumentType::DebitNote => root,
        };
        root = root
            .child(Element::leaf("cbc:DocumentCurrencyCode", CURRENCY))
            .child(Element::leaf(
                "cbc:LineCountNumeric",
                request.lines.len().to_string(),
            ));

        if kind.is_note() {
            let reference = request
                .billing_reference
                .ok_or(TemplateError::MissingReference(kind))?;
            if let Some(discrepancy) = request.discrepancy {
                root = root.child(
                    Element::new("cac:DiscrepancyResponse")
                        .child(Element::leaf("cbc:ReferenceID", &reference.number))
                        .child(Element::leaf("cbc:ResponseCode", &discrepancy.concept))
                        .child(Element::leaf("cbc:Description", &discrepancy.description)),
                );
            }
            root = root.child(
                Element::new("cac:BillingReference").child(
                    Element::new("cac:InvoiceDocumentReference")
                        .child(Element::leaf("cbc:ID", &reference.number))
                        .child(
                            Element::leaf("cbc:UUID", &reference.identifier)
                                .attr("@schemeName", "CUFE-SHA384"),
                        )
                        .child(Element::leaf(
                            "cbc:IssueDate",
                            reference.issue_date.format("%Y-%m-%d").to_string(),
                        )),
                ),
            );
        }

        root = root
            .child(supplier(request.config))
            .child(customer(request.customer))
            .children(tax_totals(request.lines))
            .child(monetary_total(kind, request.totals))
            .children(
                request
                    .lines
                    .iter()
                    .enumerate()
                    .map(|(index, line)| document_line(kind, index + 1, line)),
            );

        let body = root.to_xml()?;
        let mut xml = String::with_capacity(XML_DECLARATION.len() + body.len());
        xml.push_str(XML_DECLARATION);
        xml.push_str(&body);
        Ok(xml)
    }
}

fn document_root(kind: DocumentType) -> Element {
    let (tag, ns) = match kind {
        DocumentType::Invoice => ("Invoice", INVOICE_NS),
        DocumentType::CreditNote => ("CreditNote", CREDIT_NOTE_NS),
        DocumentType::DebitNote => ("DebitNote", DEBIT_NOTE_NS),
    };
    Element::new(tag)
        .attr("@xmlns", ns)
        .attr("@xmlns:cac", CAC_NS)
        .attr("@xmlns:cbc", CBC_NS)
        .attr("@xmlns:ext", EXT_NS)
        .attr("@xmlns:sts", STS_NS)
}

fn profile_id(kind: DocumentType) -> &'static str {
    match kind {
        DocumentType::Invoice => "DIAN 2.1: Factura Electrónica de Venta",
        DocumentType::CreditNote => "DIAN 2.1: Nota Crédito de Factura Electrónica de Venta",
        DocumentType::DebitNote => "DIAN 2.1: Nota Débito de Factura Electrónica de Venta",
    }
}

fn dian_scheme(element: Element) -> Element {
    element
        .attr("@schemeAgencyID", DIAN_AGENCY_ID)
        .attr("@schemeAgencyName", DIAN_AGENCY_NAME)
}

/// First slot carries the DIAN extension, the second is left for the signature.
fn extensions(request: &TemplateRequest<'_>) -> Result<Element, TemplateError> {
    let config = request.config;
    let software = config
        .software
        .as_ref()
        .ok_or(TemplateError::MissingConfig("software credentials"))?;

    let mut dian = Element::new("sts:DianExtensions");
    if request.document_type == DocumentType::Invoice {
        let resolution = config
            .resolution
            .as_ref()
            .ok_or(TemplateError::MissingConfig("numbering resolution"))?;
        dian = dian.child(
            Element::new("sts:InvoiceControl")
                .child(Element::leaf("sts:InvoiceAuthorization", &resolution.number))
                .child(
                    Element::new("sts:AuthorizationPeriod")
                        .child(Element::leaf(
                            "cbc:StartDate",
                            resolution.date.format("%Y-%m-%d").to_string(),
                        ))
                        .child(Element::leaf(
                            "cbc:EndDate",
                            resolution.valid_until.format("%Y-%m-%d").to_string(),
                        )),
                )
                .child(
                    Element::new("sts:AuthorizedInvoices")
                        .child(Element::leaf("sts:Prefix", &resolution.prefix))
                        .child(Element::leaf("sts:From", resolution.from.to_string()))
                        .child(Element::leaf("sts:To", resolution.to.to_string())),
                ),
        );
    }

    let security_code =
        software_security_code(&software.software_id, software.pin.expose(), request.number);
    dian = dian
        .child(
            Element::new("sts:InvoiceSource").child(
                Element::leaf("cbc:IdentificationCode", "CO")
                    .attr("@listAgencyID", "6")
                    .attr(
                        "@listAgencyName",
                        "United Nations Economic Commission for Europe",
                    )
                    .attr(
                        "@listSchemeURI",
                        "urn:oasis:names:specification:ubl:codelist:gc:CountryIdentificationCode-2.1",
                    ),
            ),
        )
        .child(
            Element::new("sts:SoftwareProvider")
                .child(
                    dian_scheme(Element::leaf("sts:ProviderID", &config.nit))
                        .attr("@schemeID", &config.check_digit)
                        .attr("@schemeName", NIT_SCHEME),
                )
                .child(dian_scheme(Element::leaf(
                    "sts:SoftwareID",
                    &software.software_id,
                ))),
        )
        .child(dian_scheme(Element::leaf(
            "sts:SoftwareSecurityCode",
            security_code,
        )))
        .child(
            Element::new("sts:AuthorizationProvider").child(
                dian_scheme(Element::leaf("sts:AuthorizationProviderID", DIAN_NIT))
                    .attr("@schemeID", "4")
                    .attr("@schemeName", NIT_SCHEME),
            ),
        )
        .child(Element::leaf("sts:QRCode", request.qr_payload));

    Ok(Element::new("ext:UBLExtensions")
        .child(
            Element::new("ext:UBLExtension")
                .child(Element::new("ext:ExtensionContent").child(dian)),
        )
        .child(Element::new("ext:UBLExtension").child(Element::new("ext:ExtensionContent"))))
}

fn supplier(config: &TenantFiscalConfig) -> Element {
    let display_name = config.trade_name.as_deref().unwrap_or(&config.legal_name);
    let mut party = Element::new("cac:Party")
        .child(Element::new("cac:PartyName").child(Element::leaf("cbc:Name", display_name)));
    if let Some(address) = &config.address {
        party = party.child(
            Element::new("cac:PhysicalLocation").child(
                Element::new("cac:Address")
                    .child(Element::leaf("cbc:CityName", &address.city))
                    .child(Element::leaf("cbc:CountrySubentity", &address.department))
                    .child(Element::new("cac:AddressLine").child(Element::leaf("cbc:Line", &address.line)))
                    .child(
                        Element::new("cac:Country")
                            .child(Element::leaf("cbc:IdentificationCode", &address.country_code)),
                    ),
            ),
        );
    }
    party = party.child(
        Element::new("cac:PartyTaxScheme")
            .child(Element::leaf("cbc:RegistrationName", &config.legal_name))
            .child(
                dian_scheme(Element::leaf("cbc:CompanyID", &config.nit))
                    .attr("@schemeID", &config.check_digit)
                    .attr("@schemeName", NIT_SCHEME),
            )
            .child(tax_scheme("01", "IVA")),
    );
    Element::new("cac:AccountingSupplierParty")
        .child(Element::leaf("cbc:AdditionalAccountID", "1"))
        .child(party)
}

fn customer(counterparty: &Counterparty) -> Element {
    Element::new("cac:AccountingCustomerParty").child(
        Element::new("cac:Party")
            .child(
                Element::new("cac:PartyName")
                    .child(Element::leaf("cbc:Name", &counterparty.name)),
            )
            .child(
                Element::new("cac:PartyTaxScheme")
                    .child(Element::leaf("cbc:RegistrationName", &counterparty.name))
                    .child(
                        dian_scheme(Element::leaf("cbc:CompanyID", counterparty.tax_id()))
                            .attr("@schemeName", &counterparty.id_scheme),
                    )
                    .child(tax_scheme("ZZ", "No aplica")),
            ),
    )
}

fn tax_scheme(id: &str, name: &str) -> Element {
    Element::new("cac:TaxScheme")
        .child(Element::leaf("cbc:ID", id))
        .child(Element::leaf("cbc:Name", name))
}

fn amount(tag: &'static str, value: Decimal) -> Element {
    Element::leaf(tag, format_amount(value)).attr("@currencyID", CURRENCY)
}

fn tax_subtotal(kind: TaxKind, rate: Decimal, taxable: Decimal, tax: Decimal) -> Element {
    Element::new("cac:TaxSubtotal")
        .child(amount("cbc:TaxableAmount", taxable))
        .child(amount("cbc:TaxAmount", tax))
        .child(
            Element::new("cac:TaxCategory")
                .child(Element::leaf("cbc:Percent", format_amount(rate)))
                .child(tax_scheme(kind.code(), kind.name())),
        )
}

/// One `TaxTotal` per tax kind present, one subtotal per rate.
fn tax_totals(lines: &[PricedLine]) -> Vec<Element> {
    let mut grouped: BTreeMap<&'static str, (TaxKind, BTreeMap<Decimal, (Decimal, Decimal)>)> =
        BTreeMap::new();
    for line in lines {
        let (_, rates) = grouped
            .entry(line.tax_kind.code())
            .or_insert_with(|| (line.tax_kind, BTreeMap::new()));
        let (taxable, tax) = rates
            .entry(line.tax_rate.normalize())
            .or_insert((Decimal::ZERO, Decimal::ZERO));
        *taxable += line.subtotal;
        *tax += line.tax;
    }

    grouped
        .into_values()
        .map(|(kind, rates)| {
            let total: Decimal = rates.values().map(|(_, tax)| *tax).sum();
            Element::new("cac:TaxTotal")
                .child(amount("cbc:TaxAmount", total))
                .children(
                    rates
                        .into_iter()
                        .map(|(rate, (taxable, tax))| tax_subtotal(kind, rate, taxable, tax)),
                )
        })
        .collect()
}

fn monetary_total(kind: DocumentType, totals: &DocumentTotals) -> Element {
    let tag = match kind {
        DocumentType::DebitNote => "cac:RequestedMonetaryTotal",
        _ => "cac:LegalMonetaryTotal",
    };
    Element::new(tag)
        .child(amount("cbc:LineExtensionAmount", totals.subtotal))
        .child(amount("cbc:TaxExclusiveAmount", totals.subtotal))
        .child(amount("cbc:TaxInclusiveAmount", totals.total))
        .child(amount("cbc:PayableAmount", totals.total))
}

fn document_line(kind: DocumentType, position: usize, line: &PricedLine) -> Element {
    let (tag, quantity_tag) = match kind {
        DocumentType::Invoice => ("cac:InvoiceLine", "cbc:InvoicedQuantity"),
        DocumentType::CreditNote => ("cac:CreditNoteLine", "cbc:CreditedQuantity"),
        DocumentType::DebitNote => ("cac:DebitNoteLine", "cbc:DebitedQuantity"),
    };
    Element::new(tag)
        .child(Element::leaf("cbc:ID", position.to_string()))
        .child(
            Element::leaf(quantity_tag, format_amount(line.quantity)).attr("@unitCode", UNIT_CODE),
        )
        .child(amount("cbc:LineExtensionAmount", line.subtotal))
        .child(
            Element::new("cac:TaxTotal")
                .child(amount("cbc:TaxAmount", line.tax))
                .child(tax_subtotal(line.tax_kind, line.tax_rate, line.subtotal, line.tax)),
        )
        .child(
            Element::new("cac:Item")
                .child(Element::leaf("cbc:Description", &line.description))
                .child(
                    Element::new("cac:StandardItemIdentification")
                        .child(Element::leaf("cbc:ID", &line.id)),
                ),
        )
        .child(
            Element::new("cac:Price")
                .child(amount("cbc:PriceAmount", line.unit_price))
                .child(
                    Element::leaf("cbc:BaseQuantity", "1.00").attr("@unitCode", UNIT_CODE),
                ),
        )
}
