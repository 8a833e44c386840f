//! Outbound TLS for `https` targets.
//!
//! Rules with `secure: true` verify the upstream certificate against the
//! platform's root store. Rules with `secure: false` accept any certificate,
//! which lets a dev server talk to backends with self-signed certificates.

use std::sync::Arc;

use anyhow::Context as _;
use hyper_rustls::ConfigBuilderExt as _;
use tokio_rustls::{
    TlsConnector,
    rustls::{
        self, ClientConfig, DigitallySignedStruct, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};
use tracing::{debug, warn};

use crate::{rule::RuleSet, upstream::Scheme};

/// Accepts every server certificate while still checking handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS connectors shared by every request, built only for what the rules need.
#[derive(Clone, Default)]
pub struct TlsConnectors {
    verifying: Option<TlsConnector>,
    insecure: Option<TlsConnector>,
}

impl TlsConnectors {
    /// Builds the connectors required by the `https` rules in `rules`.
    ///
    /// Plain `http` rule sets need no TLS at all, so nothing is loaded for them.
    pub fn for_rules(rules: &RuleSet) -> anyhow::Result<Self> {
        let https_rules = || {
            rules
                .iter()
                .filter(|rule| rule.upstream().scheme() == Scheme::Https)
        };
        let needs_verifying = https_rules().any(|rule| rule.secure());
        let needs_insecure = https_rules().any(|rule| !rule.secure());

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let verifying = if needs_verifying {
            debug!("Loading native root certificates for verified upstreams");
            let config = ClientConfig::builder_with_provider(provider.clone())
                .with_safe_default_protocol_versions()?
                .with_native_roots()
                .context("Failed to load native root certificates")?
                .with_no_client_auth();
            Some(TlsConnector::from(Arc::new(config)))
        } else {
            None
        };

        let insecure = if needs_insecure {
            warn!("Certificate validation is disabled for some https upstreams");
            let config = ClientConfig::builder_with_provider(provider.clone())
                .with_safe_default_protocol_versions()?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
                .with_no_client_auth();
            Some(TlsConnector::from(Arc::new(config)))
        } else {
            None
        };

        Ok(Self {
            verifying,
            insecure,
        })
    }

    /// Connector for a rule with the given `secure` flag.
    pub fn connector(&self, secure: bool) -> Option<&TlsConnector> {
        if secure {
            self.verifying.as_ref()
        } else {
            self.insecure.as_ref()
        }
    }
}
