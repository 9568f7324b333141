//! Device shadow documents.
//!
//! The device publishes reported-state merge documents and receives
//! delta documents when cloud-desired state diverges. A rejected desired
//! value is cleared by publishing `null` for that group under `desired`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Delta document received on `.../update/delta`.
///
/// `state` holds one object per configuration group, e.g.
/// `{"control": {"max_heat_ratio": 0.5}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowDelta {
    pub state: Value,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(rename = "clientToken", default)]
    pub client_token: Option<String>,
}

impl ShadowDelta {
    /// The per-group objects in this delta, in document order.
    /// Returns `None` when `state` is not a JSON object.
    pub fn groups(&self) -> Option<&Map<String, Value>> {
        self.state.as_object()
    }
}

/// Build a reported-state merge document from per-group snapshots.
pub fn reported_document(groups: impl IntoIterator<Item = (String, Value)>) -> Value {
    let mut reported = Map::new();
    for (name, snapshot) in groups {
        reported.insert(name, snapshot);
    }
    json!({ "state": { "reported": Value::Object(reported) } })
}

/// Build a document clearing the desired value for one group.
///
/// Publishing `null` under `desired` removes the field from the shadow so
/// an invalid desired value stops re-triggering deltas.
pub fn delete_desired_document(group: &str) -> Value {
    json!({ "state": { "desired": { group: Value::Null } } })
}
