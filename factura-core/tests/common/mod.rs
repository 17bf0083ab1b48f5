use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use factura_core::api::{StatusQuery, SubmissionGateway, Verdict};
use factura_core::config::EnvironmentType;
use factura_core::document::amounts::{LineItem, TaxKind};
use factura_core::source::{Counterparty, InvoiceRecord, InvoiceSource, NoteRecord, SourceError};
use factura_core::tenant::{
    NoteSeries, Resolution, SoftwareCredentials, StoredCertificate, TenantFiscalConfig, TenantId,
};
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    pkcs12::Pkcs12,
    pkey::PKey,
    rsa::Rsa,
    x509::{X509, X509NameBuilder},
};
use rust_decimal::Decimal;

pub const PASSWORD: &str = "secret";

/// PKCS#12 with a fresh RSA key and self-signed certificate, built once per test binary.
#[allow(dead_code)]
pub fn pkcs12_container() -> &'static [u8] {
    static CONTAINER: OnceLock<Vec<u8>> = OnceLock::new();
    CONTAINER.get_or_init(|| {
        let pkey = PKey::from_rsa(Rsa::generate(2048).expect("rsa")).expect("pkey");
        let mut name = X509NameBuilder::new().expect("name");
        name.append_entry_by_text("C", "CO").expect("C");
        name.append_entry_by_text("O", "Acme SAS").expect("O");
        name.append_entry_by_text("CN", "Acme Signer").expect("CN");
        let name = name.build();

        let mut builder = X509::builder().expect("builder");
        builder.set_version(2).expect("version");
        let serial = BigNum::from_u32(4242).expect("serial");
        builder
            .set_serial_number(&serial.to_asn1_integer().expect("asn1"))
            .expect("serial");
        builder.set_subject_name(&name).expect("subject");
        builder.set_issuer_name(&name).expect("issuer");
        builder.set_pubkey(&pkey).expect("pubkey");
        builder
            .set_not_before(&Asn1Time::days_from_now(0).expect("now"))
            .expect("not before");
        builder
            .set_not_after(&Asn1Time::days_from_now(365).expect("later"))
            .expect("not after");
        builder.sign(&pkey, MessageDigest::sha256()).expect("sign");
        let cert = builder.build();

        let mut p12 = Pkcs12::builder();
        p12.name("signer").cert(&cert).pkey(&pkey);
        p12.build2(PASSWORD).expect("p12").to_der().expect("der")
    })
}

#[allow(dead_code)]
pub fn stored_certificate() -> StoredCertificate {
    StoredCertificate {
        container: Base64::encode_string(pkcs12_container()),
        password: PASSWORD.into(),
    }
}

#[allow(dead_code)]
pub fn tenant_id() -> TenantId {
    TenantId::new("acme")
}

#[allow(dead_code)]
pub fn tenant_config() -> TenantFiscalConfig {
    TenantFiscalConfig {
        tenant_id: tenant_id(),
        nit: "900123456".into(),
        check_digit: "7".into(),
        legal_name: "Acme SAS".into(),
        trade_name: Some("Acme".into()),
        address: None,
        software: Some(SoftwareCredentials {
            software_id: "sw-001".into(),
            pin: "12345".into(),
            technical_key: "tech-key-123".into(),
        }),
        resolution: Some(Resolution {
            number: "18760000001".into(),
            date: NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"),
            valid_until: NaiveDate::from_ymd_opt(2026, 1, 1).expect("date"),
            prefix: "SETP".into(),
            from: 990000000,
            to: 995000000,
        }),
        invoice_counter: 990000001,
        credit_notes: NoteSeries::new("NC"),
        debit_notes: NoteSeries::new("ND"),
        certificate: Some(stored_certificate()),
        environment: EnvironmentType::Test,
    }
}

#[allow(dead_code)]
pub fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
    std::fs::read_to_string(path).expect("fixture")
}

#[allow(dead_code)]
pub fn issued_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 15, 30, 0).unwrap()
}

#[allow(dead_code)]
pub fn widget_line() -> LineItem {
    LineItem {
        id: "L1".into(),
        description: "Widget".into(),
        quantity: Decimal::from(4),
        unit_price: Decimal::from(25000),
        tax_rate: Decimal::from(19),
        discount: Decimal::ZERO,
        tax_kind: TaxKind::Iva,
    }
}

/// Subtotal 100000, IVA 19000, total 119000, sold to `123456789`.
#[allow(dead_code)]
pub fn invoice_record(id: &str) -> InvoiceRecord {
    InvoiceRecord {
        id: id.into(),
        issued_at: issued_at(),
        customer: Counterparty {
            tax_id: Some("123456789".into()),
            id_scheme: "13".into(),
            name: "Jane Buyer".into(),
        },
        lines: vec![widget_line()],
    }
}

#[derive(Default)]
pub struct StaticSource {
    invoices: HashMap<String, InvoiceRecord>,
    notes: HashMap<String, NoteRecord>,
}

#[allow(dead_code)]
impl StaticSource {
    pub fn with_invoice(mut self, record: InvoiceRecord) -> Self {
        self.invoices.insert(record.id.clone(), record);
        self
    }

    pub fn with_note(mut self, record: NoteRecord) -> Self {
        self.notes.insert(record.id.clone(), record);
        self
    }
}

#[async_trait]
impl InvoiceSource for StaticSource {
    async fn invoice(
        &self,
        _tenant: &TenantId,
        invoice_id: &str,
    ) -> Result<Option<InvoiceRecord>, SourceError> {
        Ok(self.invoices.get(invoice_id).cloned())
    }

    async fn note(
        &self,
        _tenant: &TenantId,
        note_id: &str,
    ) -> Result<Option<NoteRecord>, SourceError> {
        Ok(self.notes.get(note_id).cloned())
    }
}

#[allow(dead_code)]
pub fn accepted() -> Verdict {
    Verdict {
        success: true,
        is_valid: Some(true),
        status_code: "00".into(),
        description: "Procesado Correctamente.".into(),
        track_id: None,
        errors: Vec::new(),
        warnings: Vec::new(),
        transport_failure: false,
        raw_response: Some("<ok/>".into()),
    }
}

#[allow(dead_code)]
pub fn rejected(errors: &[&str]) -> Verdict {
    Verdict {
        success: false,
        is_valid: Some(false),
        status_code: "99".into(),
        description: "Validación contiene errores en campos mandatorios.".into(),
        track_id: None,
        errors: errors.iter().map(|e| e.to_string()).collect(),
        warnings: Vec::new(),
        transport_failure: false,
        raw_response: Some("<rejected/>".into()),
    }
}

#[allow(dead_code)]
pub fn pending(track_id: &str) -> Verdict {
    Verdict {
        success: false,
        is_valid: None,
        status_code: "66".into(),
        description: "Batch en proceso de validación.".into(),
        track_id: Some(track_id.into()),
        errors: Vec::new(),
        warnings: Vec::new(),
        transport_failure: false,
        raw_response: Some("<pending/>".into()),
    }
}

#[allow(dead_code)]
pub fn unreachable() -> Verdict {
    Verdict::transport_failure("TIMEOUT", "no answer from DIAN within 60s")
}

/// Gateway answering from queued verdicts, accepting once the queue is empty.
#[derive(Default)]
pub struct ScriptedGateway {
    submit_verdicts: Mutex<VecDeque<Verdict>>,
    status_verdicts: Mutex<VecDeque<Verdict>>,
    pub submitted: Mutex<Vec<(String, String)>>,
    pub status_queries: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl ScriptedGateway {
    pub fn on_submit(self, verdict: Verdict) -> Self {
        self.submit_verdicts.lock().expect("lock").push_back(verdict);
        self
    }

    pub fn on_status(self, verdict: Verdict) -> Self {
        self.status_verdicts.lock().expect("lock").push_back(verdict);
        self
    }

    pub fn submissions(&self) -> usize {
        self.submitted.lock().expect("lock").len()
    }
}

#[async_trait]
impl SubmissionGateway for ScriptedGateway {
    async fn submit(
        &self,
        _config: &TenantFiscalConfig,
        signed_xml: &str,
        file_name: &str,
    ) -> Verdict {
        self.submitted
            .lock()
            .expect("lock")
            .push((file_name.to_string(), signed_xml.to_string()));
        self.submit_verdicts
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(accepted)
    }

    async fn check_status(&self, _config: &TenantFiscalConfig, query: StatusQuery<'_>) -> Verdict {
        let key = match query {
            StatusQuery::TrackId(track_id) => format!("track:{track_id}"),
            StatusQuery::Identifier(identifier) => format!("key:{identifier}"),
        };
        self.status_queries.lock().expect("lock").push(key);
        self.status_verdicts
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(accepted)
    }
}
