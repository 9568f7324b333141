//! OTA job and stream topic classification.
//!
//! The OTA block codec itself is external; the coordination layer only
//! needs to tell job documents apart from file blocks so each lands in
//! the right handler.

use serde::Deserialize;

use crate::filters::topic_matches;
use crate::topics;

/// Custom fields of a firmware job document, as authored by the fleet
/// backend. Everything the block codec needs (stream name, file size)
/// stays opaque; the coordination layer only reads the compatibility
/// fields.
#[derive(Debug, Clone, Deserialize)]
pub struct OtaJobDocument {
    /// Thing type the image was built for.
    #[serde(default, rename = "thingType")]
    pub thing_type: Option<String>,
    /// Hardware major revision the image supports.
    #[serde(default, rename = "hardwareMajor")]
    pub hardware_major: Option<u32>,
    /// Firmware version string carried for logging.
    #[serde(default, rename = "firmwareVersion")]
    pub firmware_version: Option<String>,
}

impl OtaJobDocument {
    /// An image is compatible when every compatibility field it carries
    /// matches the device. Absent fields do not veto; legacy jobs omit
    /// them.
    pub fn compatible_with(&self, thing_type: &str, hardware_major: u32) -> bool {
        if let Some(ref t) = self.thing_type {
            if t != thing_type {
                return false;
            }
        }
        if let Some(major) = self.hardware_major {
            if major != hardware_major {
                return false;
            }
        }
        true
    }
}

/// Kind of message arriving on an OTA-related topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaTopicKind {
    /// A job document: response to a `$next/get` or an unsolicited
    /// `notify-next`.
    JobDocument,
    /// Any other job-namespace message (status responses etc).
    JobOther,
    /// A file block on a stream topic.
    FileBlock,
}

/// Classify a topic within the jobs/streams namespaces.
/// Returns `None` for topics outside both namespaces.
pub fn classify_ota_topic(topic: &str) -> Option<OtaTopicKind> {
    if topic_matches(&topics::streams_wildcard(), topic) {
        return Some(OtaTopicKind::FileBlock);
    }
    if topic_matches(&topics::jobs_wildcard(), topic) {
        if topic_matches(&topics::job_next_get_accepted(), topic)
            || topic_matches(&topics::job_notify_next(), topic)
        {
            return Some(OtaTopicKind::JobDocument);
        }
        return Some(OtaTopicKind::JobOther);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_check() {
        let doc: OtaJobDocument = serde_json::from_str(
            r#"{"thingType":"boiler","hardwareMajor":3,"firmwareVersion":"2.4.0"}"#,
        )
        .unwrap();
        assert!(doc.compatible_with("boiler", 3));
        assert!(!doc.compatible_with("boiler", 4));
        assert!(!doc.compatible_with("heat-pump", 3));
    }

    #[test]
    fn absent_compatibility_fields_do_not_veto() {
        let doc: OtaJobDocument = serde_json::from_str("{}").unwrap();
        assert!(doc.compatible_with("boiler", 1));
    }

    #[test]
    fn job_document_topics() {
        assert_eq!(
            classify_ota_topic("$aws/things/ab:cd/jobs/$next/get/accepted"),
            Some(OtaTopicKind::JobDocument)
        );
        assert_eq!(
            classify_ota_topic("$aws/things/ab:cd/jobs/notify-next"),
            Some(OtaTopicKind::JobDocument)
        );
    }

    #[test]
    fn other_job_topics() {
        assert_eq!(
            classify_ota_topic("$aws/things/ab:cd/jobs/fw-001/update/accepted"),
            Some(OtaTopicKind::JobOther)
        );
    }

    #[test]
    fn stream_topics() {
        assert_eq!(
            classify_ota_topic("$aws/things/ab:cd/streams/fw-001/data/cbor"),
            Some(OtaTopicKind::FileBlock)
        );
    }

    #[test]
    fn unrelated_topics() {
        assert_eq!(classify_ota_topic("$aws/things/ab:cd/shadow/update"), None);
        assert_eq!(classify_ota_topic("telemetry/ab:cd/status"), None);
    }
}
