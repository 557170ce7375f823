//! TLS client configuration for a scanner that talks to arbitrary origins.
//!
//! Certificate verification is disabled by construction: the targets are
//! other people's misconfigured front-ends, often with self-signed or
//! mismatched certificates, and a verification failure would read as a
//! false negative. The cipher-suite list is caller-selectable so the
//! handshake shape can be varied between runs.

use gatecrash_common::ClientConfig;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::Arc;
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{ring, CryptoProvider},
    DigitallySignedStruct, SignatureScheme,
};

use crate::error::{ClientError, ErrorKind};

/// Build the shared rustls client config: chosen ciphers, an in-memory
/// session cache, and the accept-all verifier.
pub fn client_config(cfg: &ClientConfig) -> Result<Arc<rustls::ClientConfig>, ClientError> {
    let base = ring::default_provider();

    let provider = if cfg.cipher_suites.is_empty() {
        base
    } else {
        let selected: Vec<_> = cfg
            .cipher_suites
            .iter()
            .filter_map(|name| {
                base.cipher_suites
                    .iter()
                    .find(|s| format!("{:?}", s.suite()) == *name)
                    .copied()
            })
            .collect();
        if selected.is_empty() {
            return Err(ClientError::new(
                ErrorKind::RequestBuild,
                "-",
                "tls_config",
                format!("no known cipher suites in {:?}", cfg.cipher_suites),
            ));
        }
        CryptoProvider {
            cipher_suites: selected,
            ..base
        }
    };

    let verifier = Arc::new(AcceptAnyCert {
        schemes: provider
            .signature_verification_algorithms
            .supported_schemes(),
    });

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::new(ErrorKind::RequestBuild, "-", "tls_config", e))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    config.resumption = rustls::client::Resumption::in_memory_sessions(256);
    config.enable_sni = true;

    Ok(Arc::new(config))
}

/// Verifier that accepts any certificate chain.
#[derive(Debug)]
struct AcceptAnyCert {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let cfg = ClientConfig::default();
        assert!(client_config(&cfg).is_ok());
    }

    #[test]
    fn unknown_cipher_names_are_rejected() {
        let cfg = ClientConfig {
            cipher_suites: vec!["TLS_TOTALLY_REAL_SUITE".into()],
            ..Default::default()
        };
        assert!(client_config(&cfg).is_err());
    }

    #[test]
    fn known_cipher_name_is_kept() {
        let cfg = ClientConfig {
            cipher_suites: vec!["TLS13_AES_128_GCM_SHA256".into()],
            ..Default::default()
        };
        assert!(client_config(&cfg).is_ok());
    }
}
