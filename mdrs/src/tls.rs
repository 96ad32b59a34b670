//! TLS option resolution. This module is pure: it derives the effective
//! per-connection TLS record from client configuration and parses
//! certificate subjects for X.509 authentication. Driving the actual TLS
//! session is [`transport`](crate::transport)'s job, behind the `rust-tls`
//! feature.
use std::fs::File;
use std::io::BufReader;
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use mongo_protocol::{Error, Result};

use crate::config::ClientConfig;

/// Effective TLS options for one connection. The revocation/OCSP switches
/// are internal: they never come from a connection string and are omitted by
/// [`TlsOptions::copy_without_internal`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TlsOptions {
    pub ca_file: Option<String>,
    pub pem_file: Option<String>,
    pub pem_password: Option<String>,
    pub allow_invalid_certificates: bool,
    pub allow_invalid_hostnames: bool,
    disable_certificate_revocation_check: bool,
    disable_ocsp_endpoint_check: bool,
}

impl TlsOptions {
    /// Derives the effective record from client configuration; `None` when
    /// TLS is not enabled at all.
    pub fn from_config(config: &ClientConfig) -> Option<TlsOptions> {
        config.tls().map(|params| TlsOptions {
            ca_file: params.ca_file.clone(),
            pem_file: params.certificate_key_file.clone(),
            pem_password: params.certificate_key_file_password.clone(),
            allow_invalid_certificates: params.allow_invalid_certificates,
            allow_invalid_hostnames: params.allow_invalid_hostnames,
            disable_certificate_revocation_check: params.disable_certificate_revocation_check,
            disable_ocsp_endpoint_check: params.disable_ocsp_endpoint_check,
        })
    }

    #[must_use]
    pub fn with_disabled_certificate_revocation_check(mut self) -> Self {
        self.disable_certificate_revocation_check = true;
        self
    }

    #[must_use]
    pub fn with_disabled_ocsp_endpoint_check(mut self) -> Self {
        self.disable_ocsp_endpoint_check = true;
        self
    }

    #[inline]
    pub fn disable_certificate_revocation_check(&self) -> bool {
        self.disable_certificate_revocation_check
    }

    #[inline]
    pub fn disable_ocsp_endpoint_check(&self) -> bool {
        self.disable_ocsp_endpoint_check
    }

    /// Deep copy with the internal switches reset, the form safe to hand to
    /// code outside the connection layer.
    pub fn copy_without_internal(&self) -> TlsOptions {
        TlsOptions {
            disable_certificate_revocation_check: false,
            disable_ocsp_endpoint_check: false,
            ..self.clone()
        }
    }
}

/// Reads the first certificate of a PEM file and returns its distinguished
/// name. The key in the same file may be encrypted; certificates never are,
/// so no passphrase is needed here.
pub fn extract_subject(pem_file: &str) -> Result<String> {
    let file = File::open(pem_file).map_err(|error| {
        Error::Authentication {
            reason: format!("Cannot open certificate file {}: {}", pem_file, error),
        }
    })?;

    let certificate = rustls_pemfile::certs(&mut BufReader::new(file))
        .next()
        .ok_or_else(|| Error::Authentication {
            reason: format!("{} contains no certificate", pem_file),
        })?
        .map_err(|error| Error::Authentication {
            reason: format!("Cannot read certificate from {}: {}", pem_file, error),
        })?;

    let (_, parsed) = X509Certificate::from_der(certificate.as_ref()).map_err(|error| {
        Error::Authentication {
            reason: format!("Cannot parse certificate in {}: {}", pem_file, error),
        }
    })?;

    Ok(parsed.subject().to_string())
}
