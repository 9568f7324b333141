//! Device identity: who this appliance is and which credentials it
//! presents to the broker.
//!
//! The factory ships every unit with a claim certificate; fleet
//! provisioning trades it for a per-device certificate which is then the
//! active credential. The store is re-read in full after a rotation so
//! every component sees the same material.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use ember_link::TlsMaterial;
use serde::Deserialize;

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone)]
pub struct Identity {
    pub thing_id: String,
    pub serial_number: String,
    pub thing_type: String,
    pub hardware_major: u32,
    pub hardware_minor: u32,
    pub endpoint: String,
    pub provisioning_template: String,
    pub rotation_template: String,
    pub ca_cert: String,
    pub claim_cert: String,
    pub claim_key: String,
    pub device_cert: Option<String>,
    pub device_key: Option<String>,
}

impl Identity {
    pub fn has_device_credentials(&self) -> bool {
        matches!((&self.device_cert, &self.device_key), (Some(c), Some(k)) if !c.is_empty() && !k.is_empty())
    }

    /// Certificate and key to present on the next TLS handshake: the
    /// device credentials once provisioned, the factory claim pair
    /// before that.
    pub fn active_credentials(&self) -> (&str, &str) {
        match (&self.device_cert, &self.device_key) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => (cert, key),
            _ => (&self.claim_cert, &self.claim_key),
        }
    }

    pub fn tls_material(&self) -> TlsMaterial {
        let (cert, key) = self.active_credentials();
        TlsMaterial::new(
            self.ca_cert.as_bytes().to_vec(),
            cert.as_bytes().to_vec(),
            key.as_bytes().to_vec(),
        )
    }
}

/// Durable storage for identity and credentials. Synchronous by design:
/// backends are a few small files or an NVS-style blob store.
pub trait IdentityStore: Send + Sync {
    fn load(&self) -> AgentResult<Identity>;
    fn save_device_credentials(&self, cert_pem: &str, private_key: &str) -> AgentResult<()>;
}

/// Some provisioning templates deliver PEM blocks with literal `\n`
/// escape sequences instead of newlines. Normalize before persisting.
pub fn normalize_pem(raw: &str) -> String {
    raw.replace("\\n", "\n")
}

// ── File-backed store ────────────────────────────────────────────────

/// Per-device manifest stored next to the PEM files.
#[derive(Debug, Deserialize)]
struct Manifest {
    thing_id: String,
    serial_number: String,
    thing_type: String,
    hardware_major: u32,
    hardware_minor: u32,
    endpoint: String,
    provisioning_template: String,
    rotation_template: String,
}

const MANIFEST_FILE: &str = "identity.toml";
const CA_FILE: &str = "ca.pem";
const CLAIM_CERT_FILE: &str = "claim.crt";
const CLAIM_KEY_FILE: &str = "claim.key";
const DEVICE_CERT_FILE: &str = "device.crt";
const DEVICE_KEY_FILE: &str = "device.key";

/// Identity store backed by a directory of PEM files plus a TOML
/// manifest.
pub struct FileIdentityStore {
    dir: PathBuf,
}

impl FileIdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read(&self, name: &str) -> AgentResult<String> {
        let path = self.dir.join(name);
        fs::read_to_string(&path)
            .map_err(|e| AgentError::Identity(format!("read {}: {e}", path.display())))
    }

    fn read_optional(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.dir.join(name))
            .ok()
            .filter(|s| !s.trim().is_empty())
    }

    fn write(&self, name: &str, contents: &str) -> AgentResult<()> {
        let path = self.dir.join(name);
        fs::write(&path, contents)
            .map_err(|e| AgentError::Identity(format!("write {}: {e}", path.display())))
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> AgentResult<Identity> {
        let manifest: Manifest = toml::from_str(&self.read(MANIFEST_FILE)?)
            .map_err(|e| AgentError::Identity(format!("parse {MANIFEST_FILE}: {e}")))?;
        Ok(Identity {
            thing_id: manifest.thing_id,
            serial_number: manifest.serial_number,
            thing_type: manifest.thing_type,
            hardware_major: manifest.hardware_major,
            hardware_minor: manifest.hardware_minor,
            endpoint: manifest.endpoint,
            provisioning_template: manifest.provisioning_template,
            rotation_template: manifest.rotation_template,
            ca_cert: self.read(CA_FILE)?,
            claim_cert: self.read(CLAIM_CERT_FILE)?,
            claim_key: self.read(CLAIM_KEY_FILE)?,
            device_cert: self.read_optional(DEVICE_CERT_FILE),
            device_key: self.read_optional(DEVICE_KEY_FILE),
        })
    }

    fn save_device_credentials(&self, cert_pem: &str, private_key: &str) -> AgentResult<()> {
        self.write(DEVICE_CERT_FILE, &normalize_pem(cert_pem))?;
        self.write(DEVICE_KEY_FILE, &normalize_pem(private_key))?;
        tracing::info!(dir = %self.dir.display(), "device credentials persisted");
        Ok(())
    }
}

// ── In-memory store ──────────────────────────────────────────────────

/// Store for tests: starts from a given identity, applies saves to the
/// in-memory copy.
pub struct MemoryIdentityStore {
    inner: Mutex<Identity>,
}

impl MemoryIdentityStore {
    pub fn new(identity: Identity) -> Self {
        Self {
            inner: Mutex::new(identity),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> AgentResult<Identity> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn save_device_credentials(&self, cert_pem: &str, private_key: &str) -> AgentResult<()> {
        let mut identity = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        identity.device_cert = Some(normalize_pem(cert_pem));
        identity.device_key = Some(normalize_pem(private_key));
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_identity(provisioned: bool) -> Identity {
    Identity {
        thing_id: "boiler-0042".into(),
        serial_number: "SN-0042".into(),
        thing_type: "boiler".into(),
        hardware_major: 3,
        hardware_minor: 1,
        endpoint: "iot.example.com".into(),
        provisioning_template: "heat-fleet-provision".into(),
        rotation_template: "heat-fleet-rotate".into(),
        ca_cert: "CA".into(),
        claim_cert: "CLAIM-CERT".into(),
        claim_key: "CLAIM-KEY".into(),
        device_cert: provisioned.then(|| "DEV-CERT".into()),
        device_key: provisioned.then(|| "DEV-KEY".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_credentials_before_provisioning() {
        let identity = test_identity(false);
        assert!(!identity.has_device_credentials());
        assert_eq!(identity.active_credentials(), ("CLAIM-CERT", "CLAIM-KEY"));
    }

    #[test]
    fn device_credentials_once_provisioned() {
        let identity = test_identity(true);
        assert!(identity.has_device_credentials());
        assert_eq!(identity.active_credentials(), ("DEV-CERT", "DEV-KEY"));
    }

    #[test]
    fn empty_device_cert_falls_back_to_claim() {
        let mut identity = test_identity(true);
        identity.device_cert = Some(String::new());
        assert!(!identity.has_device_credentials());
        assert_eq!(identity.active_credentials(), ("CLAIM-CERT", "CLAIM-KEY"));
    }

    #[test]
    fn normalize_pem_unescapes_newlines() {
        assert_eq!(
            normalize_pem("-----BEGIN\\nAAAA\\n-----END"),
            "-----BEGIN\nAAAA\n-----END"
        );
        assert_eq!(normalize_pem("already\nfine"), "already\nfine");
    }

    #[test]
    fn memory_store_applies_saves() {
        let store = MemoryIdentityStore::new(test_identity(false));
        store
            .save_device_credentials("NEW-CERT\\nX", "NEW-KEY")
            .unwrap();
        let identity = store.load().unwrap();
        assert_eq!(identity.device_cert.as_deref(), Some("NEW-CERT\nX"));
        assert!(identity.has_device_credentials());
    }

    #[test]
    fn file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("ember-identity-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(MANIFEST_FILE),
            r#"
thing_id = "boiler-0042"
serial_number = "SN-0042"
thing_type = "boiler"
hardware_major = 3
hardware_minor = 1
endpoint = "iot.example.com"
provisioning_template = "heat-fleet-provision"
rotation_template = "heat-fleet-rotate"
"#,
        )
        .unwrap();
        fs::write(dir.join(CA_FILE), "CA").unwrap();
        fs::write(dir.join(CLAIM_CERT_FILE), "CLAIM-CERT").unwrap();
        fs::write(dir.join(CLAIM_KEY_FILE), "CLAIM-KEY").unwrap();

        let store = FileIdentityStore::new(&dir);
        let identity = store.load().unwrap();
        assert!(!identity.has_device_credentials());
        assert_eq!(identity.thing_id, "boiler-0042");

        store.save_device_credentials("DEV\\nCERT", "DEV\\nKEY").unwrap();
        let identity = store.load().unwrap();
        assert_eq!(identity.device_cert.as_deref(), Some("DEV\nCERT"));
        assert!(identity.has_device_credentials());

        let _ = fs::remove_dir_all(&dir);
    }
}
