//! Endpoint registry and path resolution.
//!
//! # Design
//! The registry is loaded once and never mutated. Templates are tokenised at
//! load time into literal and `{name}` segments, so resolution is a single
//! pass with exact token matching: `{issue_id}` only ever matches the
//! parameter `issue_id`, and braces that do not enclose a plain identifier
//! are kept as literal text.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;

use crate::error::{ConfigError, ResolveError};
use crate::http::HttpMethod;

/// Caller-supplied path or query parameters.
pub type Params = BTreeMap<String, String>;

/// Build `Params` from string pairs.
pub fn params<I, K, V>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// Characters left unescaped in a path parameter; everything else is
/// percent-encoded, matching URI component encoding.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A tokenised path template such as `/issues/{issue_id}/comments`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = raw;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if is_param_name(&after[..close]) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Param(after[..close].to_string()));
                    rest = &after[close + 1..];
                }
                _ => {
                    literal.push('{');
                    rest = after;
                }
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self {
            raw: raw.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Placeholder names in order of first appearance.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    fn render(&self, values: &Params, out: &mut String) -> Result<(), ResolveError> {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Param(name) => {
                    let value = values
                        .get(name)
                        .ok_or_else(|| ResolveError::MissingParameter(name.clone()))?;
                    out.extend(utf8_percent_encode(value, COMPONENT));
                }
            }
        }
        Ok(())
    }
}

fn is_param_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Static description of one logical operation.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    pub category: String,
    pub name: String,
    pub path_template: PathTemplate,
    pub method: HttpMethod,
    pub cache_ttl: Option<Duration>,
    pub requires_auth: bool,
}

#[derive(Debug, Clone)]
struct Category {
    base_path: Option<PathTemplate>,
    endpoints: HashMap<String, EndpointDescriptor>,
}

/// Outcome of a registry lookup.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Found(&'a EndpointDescriptor),
    UnknownCategory,
    UnknownEndpoint,
}

/// Result of pre-flight parameter validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamValidation {
    pub is_valid: bool,
    /// Every required parameter that was not supplied, in template order.
    pub missing_params: Vec<String>,
    /// Set when the endpoint itself could not be found.
    pub error: Option<ResolveError>,
}

// --- registry document -------------------------------------------------

/// `{ [category]: { basePath?, endpoints: { [name]: {...} } } }`
pub type RegistryConfig = BTreeMap<String, CategoryConfig>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryConfig {
    #[serde(default)]
    pub base_path: Option<String>,
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub path: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub cache_ttl_ms: Option<u64>,
    #[serde(default)]
    pub requires_auth: bool,
}

/// Lookup table from (category, endpoint) to descriptor.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    categories: HashMap<String, Category>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        let categories = config
            .into_iter()
            .map(|(category_name, category)| {
                let endpoints = category
                    .endpoints
                    .into_iter()
                    .map(|(name, ep)| {
                        let descriptor = EndpointDescriptor {
                            category: category_name.clone(),
                            name: name.clone(),
                            path_template: PathTemplate::parse(&ep.path),
                            method: ep.method,
                            cache_ttl: ep.cache_ttl_ms.map(Duration::from_millis),
                            requires_auth: ep.requires_auth,
                        };
                        (name, descriptor)
                    })
                    .collect();
                let category = Category {
                    base_path: category.base_path.as_deref().map(PathTemplate::parse),
                    endpoints,
                };
                (category_name, category)
            })
            .collect();
        Self { categories }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RegistryConfig = serde_json::from_str(json)?;
        Ok(Self::new(config))
    }

    pub fn lookup(&self, category: &str, endpoint: &str) -> Lookup<'_> {
        match self.categories.get(category) {
            None => Lookup::UnknownCategory,
            Some(c) => match c.endpoints.get(endpoint) {
                Some(descriptor) => Lookup::Found(descriptor),
                None => Lookup::UnknownEndpoint,
            },
        }
    }

    pub fn descriptor(
        &self,
        category: &str,
        endpoint: &str,
    ) -> Result<&EndpointDescriptor, ResolveError> {
        match self.lookup(category, endpoint) {
            Lookup::Found(descriptor) => Ok(descriptor),
            Lookup::UnknownCategory => Err(ResolveError::UnknownCategory(category.to_string())),
            Lookup::UnknownEndpoint => Err(ResolveError::UnknownEndpoint {
                category: category.to_string(),
                endpoint: endpoint.to_string(),
            }),
        }
    }

    /// Resolve an endpoint into a concrete path, base path included.
    pub fn resolve(
        &self,
        category: &str,
        endpoint: &str,
        path_params: &Params,
    ) -> Result<String, ResolveError> {
        let descriptor = self.descriptor(category, endpoint)?;
        let mut url = String::new();
        if let Some(base) = self.base_path(category) {
            base.render(path_params, &mut url)?;
        }
        descriptor.path_template.render(path_params, &mut url)?;
        Ok(url)
    }

    pub fn get_method(&self, category: &str, endpoint: &str) -> Result<HttpMethod, ResolveError> {
        self.descriptor(category, endpoint).map(|d| d.method)
    }

    /// Placeholder names required by an endpoint, base path first.
    pub fn required_params(
        &self,
        category: &str,
        endpoint: &str,
    ) -> Result<Vec<String>, ResolveError> {
        let descriptor = self.descriptor(category, endpoint)?;
        let mut names: Vec<String> = Vec::new();
        let base = self.base_path(category).into_iter().flat_map(|b| b.params());
        for name in base.chain(descriptor.path_template.params()) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Non-failing variant of `resolve` that reports every missing parameter.
    pub fn validate_params(&self, category: &str, endpoint: &str, params: &Params) -> ParamValidation {
        match self.required_params(category, endpoint) {
            Ok(required) => {
                let missing_params: Vec<String> = required
                    .into_iter()
                    .filter(|name| !params.contains_key(name))
                    .collect();
                ParamValidation {
                    is_valid: missing_params.is_empty(),
                    missing_params,
                    error: None,
                }
            }
            Err(err) => ParamValidation {
                is_valid: false,
                missing_params: Vec::new(),
                error: Some(err),
            },
        }
    }

    fn base_path(&self, category: &str) -> Option<&PathTemplate> {
        self.categories.get(category)?.base_path.as_ref()
    }
}

/// Cache and dedup key for a request: the path plus its query string with
/// keys in sorted order.
pub fn request_key(path: &str, query: &Params) -> String {
    if query.is_empty() {
        return path.to_string();
    }
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in query {
        serializer.append_pair(k, v);
    }
    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{path}{separator}{}", serializer.finish())
}
