use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use factura_core::api::{DianClient, StatusQuery, SubmissionGateway};
use factura_core::certificate::CertificateStore;
use factura_core::config::{Config, EnvironmentType};
use factura_core::document::amounts::DocumentTotals;
use factura_core::document::identifier::{IdentifierInput, IdentifierScheme, generate};
use factura_core::document::qr::verification_payload;
use factura_core::document::sign::SignatureEngine;
use factura_core::tenant::TenantFiscalConfig;
use rust_decimal::Decimal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "factura")]
#[command(about = "DIAN electronic invoicing toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scheme {
    Cufe,
    Cude,
}

impl From<Scheme> for IdentifierScheme {
    fn from(value: Scheme) -> Self {
        match value {
            Scheme::Cufe => IdentifierScheme::Cufe,
            Scheme::Cude => IdentifierScheme::Cude,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compute a CUFE or CUDE.
    Identifier {
        #[arg(long, value_enum, default_value = "cufe")]
        scheme: Scheme,
        #[arg(long)]
        number: String,
        /// RFC 3339 timestamp, e.g. 2024-01-15T10:30:00-05:00.
        #[arg(long)]
        issued_at: DateTime<Utc>,
        #[arg(long)]
        subtotal: Decimal,
        #[arg(long, default_value = "0")]
        iva: Decimal,
        #[arg(long, default_value = "0")]
        inc: Decimal,
        #[arg(long, default_value = "0")]
        ica: Decimal,
        #[arg(long)]
        total: Decimal,
        #[arg(long)]
        nit: String,
        #[arg(long)]
        counterpart: String,
        /// Technical key for a CUFE, software PIN for a CUDE.
        #[arg(long, env = "FACTURA_IDENTIFIER_SECRET", hide_env_values = true)]
        secret: String,
        #[arg(long, default_value = "test")]
        env: EnvironmentType,
        /// Print the QR payload instead of the bare identifier.
        #[arg(long)]
        qr: bool,
    },
    /// Inspect a PKCS#12 signing container.
    CertInfo {
        #[arg(long)]
        container: PathBuf,
        #[arg(long, env = "FACTURA_CERT_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Add a XAdES-BES signature to a UBL document.
    Sign {
        #[arg(long)]
        document: PathBuf,
        #[arg(long)]
        container: PathBuf,
        #[arg(long, env = "FACTURA_CERT_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        signed_document: Option<PathBuf>,
    },
    /// Ask DIAN about a submitted document.
    Status {
        /// Tenant fiscal configuration as JSON.
        #[arg(long)]
        tenant: PathBuf,
        #[arg(long, conflicts_with = "identifier", required_unless_present = "identifier")]
        track_id: Option<String>,
        #[arg(long)]
        identifier: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Identifier {
            scheme,
            number,
            issued_at,
            subtotal,
            iva,
            inc,
            ica,
            total,
            nit,
            counterpart,
            secret,
            env,
            qr,
        } => {
            let input = IdentifierInput {
                scheme: scheme.into(),
                number,
                issued_at,
                totals: DocumentTotals {
                    subtotal,
                    iva,
                    inc,
                    ica,
                    total,
                },
                issuer_nit: nit,
                counterpart_id: counterpart,
                secret: secret.as_str().into(),
                environment: env,
            };
            let identifier = generate(&input);
            if qr {
                println!("{}", verification_payload(&input, &identifier));
            } else {
                println!("{identifier}");
            }
        }
        Commands::CertInfo {
            container,
            password,
        } => {
            let bytes = read_bytes(&container)?;
            let report = CertificateStore::validate(&bytes, &password);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_valid {
                bail!("certificate is not usable: {}", report.errors.join("; "));
            }
        }
        Commands::Sign {
            document,
            container,
            password,
            signed_document,
        } => {
            let xml = std::fs::read_to_string(&document)
                .with_context(|| format!("reading {}", document.display()))?;
            let material = CertificateStore::load(&read_bytes(&container)?, &password)
                .context("loading signing certificate")?;
            let signed = SignatureEngine::new(&material)
                .sign(&xml)
                .context("signing document")?;
            match signed_document {
                Some(path) => {
                    std::fs::write(&path, signed)
                        .with_context(|| format!("writing {}", path.display()))?;
                    tracing::debug!(path = %path.display(), "signed document written");
                }
                None => println!("{signed}"),
            }
        }
        Commands::Status {
            tenant,
            track_id,
            identifier,
            endpoint,
            timeout_secs,
        } => {
            let raw = std::fs::read_to_string(&tenant)
                .with_context(|| format!("reading {}", tenant.display()))?;
            let config: TenantFiscalConfig =
                serde_json::from_str(&raw).context("parsing tenant configuration")?;

            let mut client_config = Config::new(Duration::from_secs(timeout_secs));
            if let Some(url) = endpoint {
                client_config = client_config.with_endpoint_override(url);
            }
            let client = DianClient::new(client_config).context("building HTTP client")?;
            let query = match (&track_id, &identifier) {
                (Some(track_id), _) => StatusQuery::TrackId(track_id),
                (None, Some(identifier)) => StatusQuery::Identifier(identifier),
                (None, None) => bail!("either --track-id or --identifier is required"),
            };

            let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
            let verdict = runtime.block_on(client.check_status(&config, query));
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            if verdict.transport_failure {
                bail!("DIAN unreachable: {}", verdict.description);
            }
        }
    }

    Ok(())
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}
