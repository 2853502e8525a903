//! Endpoint normalization and protected-domain classification.

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

use crate::signing::CredentialScope;
use crate::types::{Error, ProtectedEndpoint, Result, SigningConfig};

/// How a remote tool server is reached.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Request/response, established per logical call.
    Ephemeral,
    /// Handshake-negotiated session reused across calls.
    Persistent,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ephemeral => write!(f, "ephemeral"),
            TransportKind::Persistent => write!(f, "persistent"),
        }
    }
}

/// Unresolved description of a remote tool server, as found in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Literal URL or `ref://name`.
    pub endpoint: String,
    pub transport: TransportKind,
    pub headers: BTreeMap<String, String>,
    /// Sign even when the endpoint is not classified as protected.
    pub sign: bool,
}

impl RemoteTarget {
    pub fn new(endpoint: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            headers: BTreeMap::new(),
            sign: false,
        }
    }
}

/// Pool key: normalized endpoint + transport kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub endpoint: String,
    pub transport: TransportKind,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.endpoint, self.transport)
    }
}

/// Whether requests to an endpoint get signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequirement {
    /// Protected endpoint: unsigned traffic is never sent.
    Required(CredentialScope),
    /// Signing requested by the descriptor; falls back to unsigned with a warning.
    Preferred(CredentialScope),
    None,
}

impl AuthRequirement {
    pub fn is_protected(&self) -> bool {
        matches!(self, AuthRequirement::Required(_))
    }
}

/// A target after reference resolution, normalization and classification.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub url: Url,
    pub key: PoolKey,
    pub auth: AuthRequirement,
    pub headers: HeaderMap,
}

impl ResolvedEndpoint {
    pub fn profile(&self) -> RequestProfile {
        RequestProfile {
            auth: self.auth.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// Descriptor-specific request shaping. Several descriptors may share one
/// pooled connection, so this travels with each call rather than with the
/// connection.
#[derive(Debug, Clone)]
pub struct RequestProfile {
    pub auth: AuthRequirement,
    pub headers: HeaderMap,
}

/// Canonical form used for pool keys: lower-case scheme and host, no default
/// port, no fragment, no trailing slash on non-root paths.
pub fn normalize(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| Error::unresolvable(format!("invalid endpoint url: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::unresolvable(format!(
            "unsupported endpoint scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(Error::unresolvable("endpoint url has no host"));
    }
    url.set_fragment(None);
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    Ok(url)
}

#[derive(Debug)]
struct Rule {
    pattern: Regex,
    service: String,
    region: Option<String>,
}

/// Matches hosts against the configured protected-domain globs.
#[derive(Debug)]
pub struct EndpointClassifier {
    rules: Vec<Rule>,
    region_label: Regex,
    default_region: String,
}

impl EndpointClassifier {
    pub fn new(config: &SigningConfig) -> Result<Self> {
        let rules = config
            .protected
            .iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>>>()?;
        let region_label = Regex::new(r"^[a-z]{2}(-gov)?-[a-z]+-\d+$")
            .map_err(|e| Error::internal(e.to_string()))?;
        Ok(Self {
            rules,
            region_label,
            default_region: config.default_region.clone(),
        })
    }

    /// Signing requirement for `url`, honoring a descriptor's opt-in.
    pub fn classify(&self, url: &Url, sign_requested: bool) -> AuthRequirement {
        let host = url.host_str().unwrap_or_default();
        if let Some(rule) = self.rules.iter().find(|r| r.pattern.is_match(host)) {
            let region = rule
                .region
                .clone()
                .unwrap_or_else(|| self.infer_region(host));
            return AuthRequirement::Required(CredentialScope::new(region, rule.service.clone()));
        }
        if sign_requested {
            let service = host.split('.').next().unwrap_or("execute-api").to_string();
            return AuthRequirement::Preferred(CredentialScope::new(
                self.infer_region(host),
                service,
            ));
        }
        AuthRequirement::None
    }

    fn infer_region(&self, host: &str) -> String {
        host.split('.')
            .find(|label| self.region_label.is_match(label))
            .map(str::to_string)
            .unwrap_or_else(|| self.default_region.clone())
    }

    /// Resolve a literal endpoint string into its pooled form.
    pub fn resolve(&self, literal: &str, target: &RemoteTarget) -> Result<ResolvedEndpoint> {
        let url = normalize(literal)?;
        let auth = self.classify(&url, target.sign);
        let mut headers = HeaderMap::new();
        for (name, value) in &target.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::validation(format!("invalid header name: {}", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::validation(format!("invalid value for header {}", name)))?;
            headers.insert(name, value);
        }
        Ok(ResolvedEndpoint {
            key: PoolKey {
                endpoint: url.as_str().to_string(),
                transport: target.transport,
            },
            url,
            auth,
            headers,
        })
    }
}

fn compile_rule(rule: &ProtectedEndpoint) -> Result<Rule> {
    let body: String = rule
        .pattern
        .to_ascii_lowercase()
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    let pattern = Regex::new(&format!("^{}$", body))
        .map_err(|e| Error::validation(format!("bad protected pattern {}: {}", rule.pattern, e)))?;
    Ok(Rule {
        pattern,
        service: rule.service.clone(),
        region: rule.region.clone(),
    })
}
