use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Identifies a single relation instance.
pub type RelationId = u32;

/// The raw application databag published by a relation's remote application.
pub type RelationData = BTreeMap<String, String>;

/// Headers the proxy may inject into forwarded requests.
pub const SUPPORTED_HEADERS: [&str; 5] = ["X-User", "X-Email", "X-Name", "X-Invite-Url", "X-Roles"];

const PROTECTED_URLS: &str = "protected_urls";
const ALLOWED_ENDPOINTS: &str = "allowed_endpoints";
const HEADERS: &str = "headers";

/// A requirer's validated auth-proxy declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtectedUpstream {
    pub relation_id: RelationId,

    /// Namespaces the names of every rule and artifact generated for this relation.
    pub app_name: String,

    /// Absolute URLs, in declaration order.
    pub protected_urls: Vec<String>,

    /// Sub-paths of every protected URL that require no authentication. Unique, in declaration
    /// order.
    pub allowed_endpoints: Vec<String>,

    pub headers: Vec<String>,
}

#[derive(Debug, Error)]
pub enum InvalidUpstream {
    #[error("application name must not be empty")]
    MissingAppName,

    #[error("missing required key {0}")]
    MissingKey(&'static str),

    #[error("{key} must be a JSON array of strings: {source}")]
    Json {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid URL {0}")]
    Url(String),

    #[error("Unsupported header {0}")]
    Header(String),

    #[error("invalid allowed endpoint {0:?}")]
    Endpoint(String),
}

// === impl ProtectedUpstream ===

impl ProtectedUpstream {
    /// Parses a requirer's databag.
    ///
    /// An empty databag means the requirer has not published anything yet and yields `None`.
    /// Anything else is validated in full: a single bad value rejects the whole declaration.
    pub fn from_relation_data(
        relation_id: RelationId,
        app_name: impl Into<String>,
        data: &RelationData,
    ) -> Result<Option<Self>, InvalidUpstream> {
        if data.is_empty() {
            return Ok(None);
        }

        let protected_urls = match data.get(PROTECTED_URLS) {
            Some(value) => parse_list(PROTECTED_URLS, value)?,
            None => return Err(InvalidUpstream::MissingKey(PROTECTED_URLS)),
        };
        let allowed_endpoints = optional_list(data, ALLOWED_ENDPOINTS)?;
        let headers = optional_list(data, HEADERS)?;

        Self::new(
            relation_id,
            app_name,
            protected_urls,
            allowed_endpoints,
            headers,
        )
        .map(Some)
    }

    pub fn new(
        relation_id: RelationId,
        app_name: impl Into<String>,
        protected_urls: Vec<String>,
        mut allowed_endpoints: Vec<String>,
        headers: Vec<String>,
    ) -> Result<Self, InvalidUpstream> {
        let app_name = app_name.into();
        if app_name.is_empty() {
            return Err(InvalidUpstream::MissingAppName);
        }

        for url in &protected_urls {
            validate_url(url)?;
        }

        for header in &headers {
            if !SUPPORTED_HEADERS.contains(&header.as_str()) {
                return Err(InvalidUpstream::Header(header.clone()));
            }
        }

        for endpoint in &allowed_endpoints {
            validate_endpoint(endpoint)?;
        }
        let mut seen = HashSet::new();
        allowed_endpoints.retain(|endpoint| seen.insert(endpoint.clone()));

        Ok(Self {
            relation_id,
            app_name,
            protected_urls,
            allowed_endpoints,
            headers,
        })
    }
}

fn parse_list(key: &'static str, value: &str) -> Result<Vec<String>, InvalidUpstream> {
    serde_json::from_str(value).map_err(|source| InvalidUpstream::Json { key, source })
}

fn optional_list(data: &RelationData, key: &'static str) -> Result<Vec<String>, InvalidUpstream> {
    data.get(key)
        .map(|value| parse_list(key, value))
        .transpose()
        .map(Option::unwrap_or_default)
}

fn validate_url(url: &str) -> Result<(), InvalidUpstream> {
    let invalid = || InvalidUpstream::Url(url.to_string());
    let uri = url.parse::<http::Uri>().map_err(|_| invalid())?;

    let scheme = uri.scheme().ok_or_else(invalid)?;
    if *scheme != http::uri::Scheme::HTTP && *scheme != http::uri::Scheme::HTTPS {
        return Err(invalid());
    }

    match uri.host() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}

// Endpoints are spliced into rule patterns verbatim (allow rules) and escaped (deny rules), so
// the pattern delimiters and whitespace are never acceptable.
fn validate_endpoint(endpoint: &str) -> Result<(), InvalidUpstream> {
    let invalid = endpoint.is_empty()
        || endpoint.starts_with('/')
        || endpoint
            .chars()
            .any(|c| c == '<' || c == '>' || c.is_whitespace());
    if invalid {
        return Err(InvalidUpstream::Endpoint(endpoint.to_string()));
    }
    Ok(())
}
