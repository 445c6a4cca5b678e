//! Derivation of the dedup keys stored for a report.

use thiserror::Error;
use url::{Host, Url};

use crate::report::ViolationReportBody;

/// The document URI of a report could not be parsed as a URL.
#[derive(Error, Debug)]
#[error("could not parse document URI {uri:?}")]
pub struct MalformedDocumentUri {
    pub uri: String,
    #[source]
    pub source: url::ParseError,
}

/// Lower-cased keys identifying a violation in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedReport {
    pub hostname: String,
    /// The percent-encoded path of the document URI.
    pub uri: String,
    pub policy: String,
    pub directive: String,
}

pub fn normalize(body: &ViolationReportBody) -> Result<NormalizedReport, MalformedDocumentUri> {
    let url = Url::parse(&body.document_uri).map_err(|source| MalformedDocumentUri {
        uri: body.document_uri.clone(),
        source,
    })?;

    let hostname = match url.host() {
        Some(Host::Domain(domain)) => domain.to_lowercase(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        None => String::new(),
    };

    Ok(NormalizedReport {
        hostname,
        uri: url.path().to_lowercase(),
        policy: body.original_policy.to_lowercase(),
        directive: body.violated_directive.to_lowercase(),
    })
}
