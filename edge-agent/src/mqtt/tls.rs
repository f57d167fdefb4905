//! rustls client configuration for the MQTT transport

use crate::config::MqttConfig;
use crate::error::{AgentError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;

/// Build the client TLS config: configured roots, optional client identity,
/// and certificate verification disabled when `skip_tls_verify` is set
pub fn client_config(mqtt: &MqttConfig) -> Result<ClientConfig> {
    let builder = if mqtt.skip_tls_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
    } else {
        ClientConfig::builder().with_root_certificates(root_store(&mqtt.ca_pem)?)
    };

    if !mqtt.mtls {
        return Ok(builder.with_no_client_auth());
    }

    let certs = parse_certs(&mqtt.client_cert_pem)?;
    if certs.is_empty() {
        return Err(AgentError::MtlsSetupFailed(
            "client certificate PEM holds no certificate".to_string(),
        ));
    }
    let key = parse_key(&mqtt.client_key_pem)?;
    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| AgentError::MtlsSetupFailed(e.to_string()))
}

/// Configured CA certificates, or the public web roots when none is set
fn root_store(ca_pem: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    if ca_pem.trim().is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    }
    for cert in parse_certs(ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| AgentError::MtlsSetupFailed(format!("invalid CA certificate: {e}")))?;
    }
    Ok(roots)
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| AgentError::MtlsSetupFailed(format!("parsing certificates: {e}")))
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| AgentError::MtlsSetupFailed(format!("parsing private key: {e}")))?
        .ok_or_else(|| AgentError::MtlsSetupFailed("no private key in PEM".to_string()))
}

/// Verifier used for `skip_tls_verify`
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
