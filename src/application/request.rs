//! Per-request inputs and outputs seen by blocks: the request, the mutable
//! request state shared by all blocks of a page, and the response headers.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Mutex, RwLock},
};

use url::Url;

use crate::{
    cache::lock::{mutex_lock, rw_read, rw_write},
    domain::error::DomainError,
};

const SOURCE: &str = "application::request";
const BASE_URL: &str = "http://localhost/";
const DEFAULT_METHOD: &str = "GET";

#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    url: String,
    path: String,
    query: Vec<(String, String)>,
    cookies: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
}

impl Request {
    /// Build a request from an absolute URL or a path with an optional query.
    pub fn from_url(raw: &str) -> Result<Self, DomainError> {
        let base = Url::parse(BASE_URL).map_err(|err| DomainError::invariant(err.to_string()))?;
        let parsed = Url::options()
            .base_url(Some(&base))
            .parse(raw)
            .map_err(|err| DomainError::validation(format!("invalid request url `{raw}`: {err}")))?;

        let query = parsed
            .query_pairs()
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        Ok(Self {
            method: DEFAULT_METHOD.to_string(),
            url: raw.to_string(),
            path: parsed.path().to_string(),
            query,
            cookies: BTreeMap::new(),
            headers: BTreeMap::new(),
        })
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_ascii_uppercase();
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query arguments in request order.
    pub fn query_args(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn query_arg(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(arg, _)| arg == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateValue {
    String(String),
    Long(i64),
    Bool(bool),
}

impl StateValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "String",
            Self::Long(_) => "Long",
            Self::Bool(_) => "Boolean",
        }
    }

    /// Truthiness used by guards: non-empty strings, non-zero numbers, `true`.
    pub fn is_true(&self) -> bool {
        match self {
            Self::String(value) => !value.is_empty(),
            Self::Long(value) => *value != 0,
            Self::Bool(value) => *value,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(value) => f.write_str(value),
            Self::Long(value) => write!(f, "{value}"),
            Self::Bool(value) => f.write_str(if *value { "1" } else { "0" }),
        }
    }
}

/// Request-scoped variables written and read by blocks.
#[derive(Debug, Default)]
pub struct State {
    values: RwLock<BTreeMap<String, StateValue>>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, value: StateValue) {
        rw_write(&self.values, SOURCE, "state.set").insert(name.into(), value);
    }

    /// Set `name` only when it is not present yet.
    pub fn set_default(&self, name: impl Into<String>, value: StateValue) {
        rw_write(&self.values, SOURCE, "state.set_default")
            .entry(name.into())
            .or_insert(value);
    }

    pub fn get(&self, name: &str) -> Option<StateValue> {
        rw_read(&self.values, SOURCE, "state.get").get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        rw_read(&self.values, SOURCE, "state.has").contains_key(name)
    }

    pub fn is(&self, name: &str) -> bool {
        rw_read(&self.values, SOURCE, "state.is")
            .get(name)
            .is_some_and(StateValue::is_true)
    }

    /// Remove every variable whose name starts with `prefix`.
    pub fn erase_prefix(&self, prefix: &str) -> usize {
        let mut values = rw_write(&self.values, SOURCE, "state.erase_prefix");
        let before = values.len();
        values.retain(|name, _| !name.starts_with(prefix));
        before - values.len()
    }

    pub fn snapshot(&self) -> Vec<(String, StateValue)> {
        rw_read(&self.values, SOURCE, "state.snapshot")
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

pub const STATUS_OK: u16 = 200;

#[derive(Debug)]
pub struct Response {
    inner: Mutex<ResponseInner>,
}

#[derive(Debug, Clone)]
struct ResponseInner {
    status: u16,
    headers: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ResponseInner {
                status: STATUS_OK,
                headers: Vec::new(),
                cookies: Vec::new(),
            }),
        }
    }

    pub fn status(&self) -> u16 {
        mutex_lock(&self.inner, SOURCE, "response.status").status
    }

    pub fn set_status(&self, status: u16) {
        mutex_lock(&self.inner, SOURCE, "response.set_status").status = status;
    }

    /// Set a header, replacing an earlier value with the same name.
    pub fn set_header(&self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut inner = mutex_lock(&self.inner, SOURCE, "response.set_header");
        match inner
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value,
            None => inner.headers.push((name.to_string(), value)),
        }
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        mutex_lock(&self.inner, SOURCE, "response.headers")
            .headers
            .clone()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        mutex_lock(&self.inner, SOURCE, "response.header")
            .headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
        mutex_lock(&self.inner, SOURCE, "response.set_cookie")
            .cookies
            .push((name.into(), value.into()));
    }

    pub fn cookies(&self) -> Vec<(String, String)> {
        mutex_lock(&self.inner, SOURCE, "response.cookies")
            .cookies
            .clone()
    }
}
