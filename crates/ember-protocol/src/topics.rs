//! Topic builders for the AWS-IoT-style topic space.
//!
//! Topic structure:
//! ```text
//! $aws/certificates/create/json[/accepted|/rejected]
//! $aws/provisioning-templates/{template}/provision/json[/accepted|/rejected]
//! $aws/things/{thing}/shadow/{get,update,delete}[/accepted|/rejected|/delta]
//! $aws/things/{thing}/shadow/name/{name}/{get,update,delete}[/...]
//! $aws/things/+/jobs/#
//! $aws/things/+/streams/#
//! ```
//!
//! Everything here returns owned `String`s; topic lifetime management is
//! the caller's problem and nobody else's.

const PREFIX: &str = "$aws";

// ─── Fleet provisioning ───

pub fn certificate_create() -> String {
    format!("{PREFIX}/certificates/create/json")
}

pub fn certificate_create_accepted() -> String {
    format!("{PREFIX}/certificates/create/json/accepted")
}

pub fn certificate_create_rejected() -> String {
    format!("{PREFIX}/certificates/create/json/rejected")
}

pub fn register_thing(template: &str) -> String {
    format!("{PREFIX}/provisioning-templates/{template}/provision/json")
}

pub fn register_thing_accepted(template: &str) -> String {
    format!("{PREFIX}/provisioning-templates/{template}/provision/json/accepted")
}

pub fn register_thing_rejected(template: &str) -> String {
    format!("{PREFIX}/provisioning-templates/{template}/provision/json/rejected")
}

// ─── OTA jobs & streams ───

/// Wildcard filter covering all job topics for any thing.
pub fn jobs_wildcard() -> String {
    format!("{PREFIX}/things/+/jobs/#")
}

/// Wildcard filter covering all stream (file block) topics for any thing.
pub fn streams_wildcard() -> String {
    format!("{PREFIX}/things/+/streams/#")
}

pub fn job_next_get_accepted() -> String {
    format!("{PREFIX}/things/+/jobs/$next/get/accepted")
}

pub fn job_notify_next() -> String {
    format!("{PREFIX}/things/+/jobs/notify-next")
}

// ─── Device shadows ───

/// Shadow operation name on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowOp {
    Get,
    Update,
    Delete,
}

impl ShadowOp {
    fn as_str(self) -> &'static str {
        match self {
            ShadowOp::Get => "get",
            ShadowOp::Update => "update",
            ShadowOp::Delete => "delete",
        }
    }
}

/// Build a shadow topic for `thing`. An empty `name` selects the classic
/// (unnamed) shadow. `suffix` is appended when non-empty, e.g. `accepted`,
/// `delta`, or `#` for a response filter.
pub fn shadow(thing: &str, name: &str, op: ShadowOp, suffix: &str) -> String {
    let op = op.as_str();
    match (name.is_empty(), suffix.is_empty()) {
        (true, true) => format!("{PREFIX}/things/{thing}/shadow/{op}"),
        (true, false) => format!("{PREFIX}/things/{thing}/shadow/{op}/{suffix}"),
        (false, true) => format!("{PREFIX}/things/{thing}/shadow/name/{name}/{op}"),
        (false, false) => format!("{PREFIX}/things/{thing}/shadow/name/{name}/{op}/{suffix}"),
    }
}

/// The full topic set one shadow reconciler works with.
#[derive(Debug, Clone)]
pub struct ShadowTopics {
    /// Publish here with an empty payload to request the document.
    pub get: String,
    /// Publish reported/desired merge documents here.
    pub update: String,
    /// Response filter for get accepted/rejected.
    pub get_responses: String,
    /// Response filter for update accepted/rejected/delta/documents.
    pub update_responses: String,
    /// Response filter for delete accepted/rejected.
    pub delete_responses: String,
}

impl ShadowTopics {
    pub fn new(thing: &str, name: &str) -> Self {
        Self {
            get: shadow(thing, name, ShadowOp::Get, ""),
            update: shadow(thing, name, ShadowOp::Update, ""),
            get_responses: shadow(thing, name, ShadowOp::Get, "#"),
            update_responses: shadow(thing, name, ShadowOp::Update, "#"),
            delete_responses: shadow(thing, name, ShadowOp::Delete, "#"),
        }
    }

    /// All three response filters, in subscription order.
    pub fn response_filters(&self) -> [&str; 3] {
        [
            &self.get_responses,
            &self.update_responses,
            &self.delete_responses,
        ]
    }
}
