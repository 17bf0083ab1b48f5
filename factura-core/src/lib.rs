//! Rust toolkit for DIAN electronic invoicing: CUFE/CUDE identifiers,
//! XAdES-BES signing, SOAP submission and the document lifecycle.
//!
//! # Examples
//! ```rust
//! use factura_core::config::{Config, EnvironmentType};
//!
//! let config = Config::default();
//! assert!(config.endpoint(EnvironmentType::Test).starts_with("https://"));
//! ```
pub mod api;
pub mod certificate;
pub mod config;
pub mod document;
pub mod lifecycle;
pub mod source;
pub mod tenant;

use thiserror::Error;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Environment(#[from] config::EnvironmentParseError),
    #[error(transparent)]
    Certificate(#[from] certificate::CertificateError),
    #[error(transparent)]
    Identifier(#[from] document::identifier::IdentifierError),
    #[error(transparent)]
    Signing(#[from] document::sign::SigningError),
    #[error(transparent)]
    Template(#[from] document::xml::template::TemplateError),
    #[error(transparent)]
    Gateway(#[from] api::GatewayError),
    #[error(transparent)]
    Store(#[from] lifecycle::store::StoreError),
    #[error(transparent)]
    Source(#[from] source::SourceError),
    #[error(transparent)]
    Lifecycle(#[from] lifecycle::LifecycleError),
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::{
        certificate::CertificateError,
        config::EnvironmentParseError,
        document::identifier::IdentifierError,
        document::sign::SigningError,
        document::xml::{XmlError, template::TemplateError},
        lifecycle::{LifecycleError, store::StoreError},
        source::SourceError,
    };
    use quick_xml::se::SeError;

    #[test]
    fn error_conversions_cover_variants() {
        let err: Error = EnvironmentParseError::Invalid {
            input: "staging".into(),
        }
        .into();
        assert!(matches!(err, Error::Environment(_)));

        let err: Error = CertificateError::InvalidCredential("mac".into()).into();
        assert!(matches!(err, Error::Certificate(_)));

        let err: Error = IdentifierError::InvalidFormat {
            input: "xyz".into(),
        }
        .into();
        assert!(matches!(err, Error::Identifier(_)));

        let err: Error = SigningError::AlreadySigned.into();
        assert!(matches!(err, Error::Signing(_)));

        let xml_err = XmlError::Serialize {
            source: SeError::Custom("xml".into()),
        };
        let err: Error = TemplateError::from(xml_err).into();
        assert!(matches!(err, Error::Template(_)));

        let err: Error = StoreError::Backend("down".into()).into();
        assert!(matches!(err, Error::Store(_)));

        let err: Error = SourceError::Unavailable("down".into()).into();
        assert!(matches!(err, Error::Source(_)));

        let err: Error = LifecycleError::RemoteUnavailable("timeout".into()).into();
        assert!(matches!(err, Error::Lifecycle(_)));
        assert_eq!(err.to_string(), "authority unavailable: timeout");
    }
}
