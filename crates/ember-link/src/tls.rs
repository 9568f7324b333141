//! TLS configuration for mTLS sessions to the broker.
//!
//! Certificate material arrives as in-memory PEM blobs from the identity
//! store (never file paths — rotation swaps blobs without touching disk
//! layout) and is handed to rumqttc's rustls transport.

use rumqttc::{TlsConfiguration, Transport};

use crate::error::{LinkError, LinkResult};

/// In-memory TLS identity for one session.
#[derive(Clone)]
pub struct TlsMaterial {
    pub ca_cert: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_cert_len", &self.ca_cert.len())
            .field("client_cert_len", &self.client_cert.len())
            .finish_non_exhaustive()
    }
}

impl TlsMaterial {
    pub fn new(
        ca_cert: impl Into<Vec<u8>>,
        client_cert: impl Into<Vec<u8>>,
        client_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            ca_cert: ca_cert.into(),
            client_cert: client_cert.into(),
            client_key: client_key.into(),
        }
    }
}

/// Build a TLS transport from in-memory PEM material.
pub fn transport(material: &TlsMaterial) -> LinkResult<Transport> {
    if material.ca_cert.is_empty() {
        return Err(LinkError::Tls("empty CA certificate".into()));
    }
    if material.client_cert.is_empty() || material.client_key.is_empty() {
        return Err(LinkError::Tls("empty client certificate or key".into()));
    }

    Ok(Transport::tls_with_config(TlsConfiguration::Simple {
        ca: material.ca_cert.clone(),
        alpn: None,
        client_auth: Some((material.client_cert.clone(), material.client_key.clone())),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ca_is_rejected() {
        let material = TlsMaterial::new(vec![], b"cert".to_vec(), b"key".to_vec());
        let err = transport(&material).err().expect("should fail");
        assert!(err.to_string().contains("CA"));
    }

    #[test]
    fn empty_client_material_is_rejected() {
        let material = TlsMaterial::new(b"ca".to_vec(), vec![], b"key".to_vec());
        assert!(transport(&material).is_err());
    }

    #[test]
    fn debug_does_not_leak_key() {
        let material = TlsMaterial::new(b"ca".to_vec(), b"cert".to_vec(), b"secret-key".to_vec());
        let rendered = format!("{material:?}");
        assert!(!rendered.contains("secret-key"));
    }
}
