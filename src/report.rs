//! CSP violation report payloads.

use serde::{Deserialize, Deserializer};

/// The JSON envelope a browser POSTs when a policy is violated.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ViolationReport {
    #[serde(rename = "csp-report", default)]
    pub body: ViolationReportBody,
}

/// The fields nested within a violation report.
///
/// Browsers omit fields or send `null` freely, so every string defaults to empty.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct ViolationReportBody {
    #[serde(deserialize_with = "null_as_empty")]
    pub document_uri: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub referrer: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub blocked_uri: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub violated_directive: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub effective_directive: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub original_policy: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub disposition: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub script_sample: String,
    /// Arrives as either a number or a string depending on the browser.
    /// Only ever logged.
    pub status_code: serde_json::Value,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
