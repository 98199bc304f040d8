//! Cache strategies: how the variable inputs of a request contribute to a
//! cache key, and when a request must bypass the cache altogether.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use thiserror::Error;

use crate::{application::context::Context, domain::tag::TagKeyBuilder};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("unknown cache sub-strategy `{kind}` in strategy `{strategy}`")]
    UnknownKind { strategy: String, kind: String },
    #[error("invalid cache strategy `{strategy}`: {reason}")]
    Invalid { strategy: String, reason: String },
}

impl StrategyError {
    fn invalid(strategy: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            strategy: strategy.to_string(),
            reason: reason.into(),
        }
    }
}

/// Cookie rules shared by strategies and page cacheability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookiePolicy {
    /// Response cookies that do not prevent a page from being cached.
    pub allow_caching_cookies: BTreeSet<String>,
    /// Cookies that may never take part in a cache key.
    pub deny_cookies: BTreeSet<String>,
}

impl CookiePolicy {
    pub fn allows_caching(&self, cookie: &str) -> bool {
        self.allow_caching_cookies.contains(cookie)
    }

    pub fn denies(&self, cookie: &str) -> bool {
        self.deny_cookies.contains(cookie)
    }
}

pub trait SubStrategy: Send + Sync {
    fn create_key(&self, ctx: &Context) -> String;

    fn no_cache(&self, _ctx: &Context) -> bool {
        false
    }

    /// Static description of the declared inputs.
    fn signature(&self) -> String;
}

/// One configured part of a strategy, before it is resolved by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSpec {
    pub kind: String,
    pub value: String,
    pub sort: bool,
    pub except: bool,
}

impl PartSpec {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
            sort: true,
            except: false,
        }
    }

    pub fn unsorted(self) -> Self {
        Self {
            sort: false,
            ..self
        }
    }

    pub fn except(self) -> Self {
        Self {
            except: true,
            ..self
        }
    }
}

/// A named strategy as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyDefinition {
    pub name: String,
    pub parts: Vec<PartSpec>,
}

fn split_names(value: &str) -> Vec<String> {
    value
        .split(|ch: char| ch == ',' || ch.is_whitespace())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Escape the separators a sub-key joins its entries with.
fn push_escaped(buf: &mut String, value: &str) {
    for ch in value.chars() {
        if matches!(ch, '\\' | '&' | '=' | ':' | '|') {
            buf.push('\\');
        }
        buf.push(ch);
    }
}

fn join_pairs<'a, I>(pairs: I, assign: char, separator: char) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut key = String::new();
    for (index, (name, value)) in pairs.into_iter().enumerate() {
        if index > 0 {
            key.push(separator);
        }
        push_escaped(&mut key, name);
        key.push(assign);
        push_escaped(&mut key, value);
    }
    key
}

fn sorted_names(value: &str) -> Vec<String> {
    let mut names = split_names(value);
    names.sort();
    names.dedup();
    names
}

#[derive(Debug)]
pub struct QueryStrategy {
    names: Vec<String>,
    sort: bool,
    except: bool,
}

impl QueryStrategy {
    pub fn new(names: Vec<String>, sort: bool, except: bool) -> Result<Self, String> {
        if except && names.is_empty() {
            return Err("`except` needs at least one query argument".to_string());
        }
        let mut names = names;
        names.sort();
        names.dedup();
        Ok(Self {
            names,
            sort,
            except,
        })
    }

    fn selects(&self, name: &str) -> bool {
        if self.names.is_empty() {
            return true;
        }
        let listed = self.names.binary_search_by(|probe| probe.as_str().cmp(name)).is_ok();
        listed != self.except
    }
}

impl SubStrategy for QueryStrategy {
    fn create_key(&self, ctx: &Context) -> String {
        let mut args: Vec<(&str, &str)> = ctx
            .request()
            .query_args()
            .iter()
            .filter(|(name, _)| !name.is_empty() && self.selects(name))
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        if self.sort {
            args.sort();
        }
        join_pairs(args, '=', '&')
    }

    fn signature(&self) -> String {
        format!(
            "query({};sort={};except={})",
            self.names.join(","),
            self.sort,
            self.except
        )
    }
}

#[derive(Debug)]
pub struct CookieStrategy {
    names: Vec<String>,
}

impl CookieStrategy {
    pub fn new(names: Vec<String>, policy: &CookiePolicy) -> Result<Self, String> {
        if let Some(denied) = names.iter().find(|name| policy.denies(name)) {
            return Err(format!("cookie `{denied}` is denied by policy"));
        }
        let mut names = names;
        names.sort();
        names.dedup();
        Ok(Self { names })
    }
}

impl SubStrategy for CookieStrategy {
    fn create_key(&self, ctx: &Context) -> String {
        let request = ctx.request();
        join_pairs(
            self.names.iter().filter_map(|name| {
                request
                    .cookie(name)
                    .map(|value| (name.as_str(), value))
            }),
            ':',
            '|',
        )
    }

    fn signature(&self) -> String {
        format!("cookie({})", self.names.join(","))
    }
}

/// Bypasses the cache unless every listed cookie is present.
#[derive(Debug)]
pub struct NoCacheCookieStrategy {
    names: Vec<String>,
}

impl SubStrategy for NoCacheCookieStrategy {
    fn create_key(&self, _ctx: &Context) -> String {
        String::new()
    }

    fn no_cache(&self, ctx: &Context) -> bool {
        self.names
            .iter()
            .any(|name| ctx.request().cookie(name).is_none())
    }

    fn signature(&self) -> String {
        format!("no-cache-cookie({})", self.names.join(","))
    }
}

/// Bypasses the cache when a listed state variable holds a true value.
#[derive(Debug)]
pub struct NoCacheStateStrategy {
    names: Vec<String>,
}

impl SubStrategy for NoCacheStateStrategy {
    fn create_key(&self, _ctx: &Context) -> String {
        String::new()
    }

    fn no_cache(&self, ctx: &Context) -> bool {
        self.names.iter().any(|name| ctx.state().is(name))
    }

    fn signature(&self) -> String {
        format!("no-cache-state({})", self.names.join(","))
    }
}

/// Composition of sub-strategies in registration order.
pub struct CacheStrategy {
    name: String,
    subs: Vec<Box<dyn SubStrategy>>,
    signature: String,
}

impl CacheStrategy {
    pub fn new(name: impl Into<String>, subs: Vec<Box<dyn SubStrategy>>) -> Self {
        let signature = subs
            .iter()
            .map(|sub| sub.signature())
            .collect::<Vec<_>>()
            .join(";");
        Self {
            name: name.into(),
            subs,
            signature,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn create_key(&self, ctx: &Context) -> String {
        self.subs
            .iter()
            .fold(TagKeyBuilder::new(&self.signature), |builder, sub| {
                builder.push(sub.create_key(ctx))
            })
            .finish()
            .into_string()
    }

    pub fn no_cache(&self, ctx: &Context) -> bool {
        self.subs.iter().any(|sub| sub.no_cache(ctx))
    }

    /// Mark the root context no-cache when any part asks for it.
    pub fn init_context(&self, ctx: &Context) {
        if self.no_cache(ctx) {
            ctx.root().set_no_cache();
        }
    }
}

impl fmt::Debug for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStrategy")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

pub type SubStrategyFactory = fn(&PartSpec, &CookiePolicy) -> Result<Box<dyn SubStrategy>, String>;

fn query_factory(part: &PartSpec, _policy: &CookiePolicy) -> Result<Box<dyn SubStrategy>, String> {
    QueryStrategy::new(split_names(&part.value), part.sort, part.except)
        .map(|strategy| Box::new(strategy) as Box<dyn SubStrategy>)
}

fn cookie_factory(part: &PartSpec, policy: &CookiePolicy) -> Result<Box<dyn SubStrategy>, String> {
    CookieStrategy::new(split_names(&part.value), policy)
        .map(|strategy| Box::new(strategy) as Box<dyn SubStrategy>)
}

fn no_cache_cookie_factory(
    part: &PartSpec,
    _policy: &CookiePolicy,
) -> Result<Box<dyn SubStrategy>, String> {
    let names = sorted_names(&part.value);
    if names.is_empty() {
        return Err("`no-cache-cookie` needs at least one cookie".to_string());
    }
    Ok(Box::new(NoCacheCookieStrategy { names }))
}

fn no_cache_state_factory(
    part: &PartSpec,
    _policy: &CookiePolicy,
) -> Result<Box<dyn SubStrategy>, String> {
    let names = sorted_names(&part.value);
    if names.is_empty() {
        return Err("`no-cache-state` needs at least one state variable".to_string());
    }
    Ok(Box::new(NoCacheStateStrategy { names }))
}

/// Sub-strategy factories by kind name.
#[derive(Clone)]
pub struct StrategyRegistry {
    factories: HashMap<String, SubStrategyFactory>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("query", query_factory);
        registry.register("cookie", cookie_factory);
        registry.register("no-cache-cookie", no_cache_cookie_factory);
        registry.register("no-cache-state", no_cache_state_factory);
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: SubStrategyFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn build(
        &self,
        definition: &StrategyDefinition,
        policy: &CookiePolicy,
    ) -> Result<CacheStrategy, StrategyError> {
        let mut subs = Vec::with_capacity(definition.parts.len());
        for part in &definition.parts {
            let factory =
                self.factories
                    .get(&part.kind)
                    .ok_or_else(|| StrategyError::UnknownKind {
                        strategy: definition.name.clone(),
                        kind: part.kind.clone(),
                    })?;
            subs.push(
                factory(part, policy)
                    .map_err(|reason| StrategyError::invalid(&definition.name, reason))?,
            );
        }
        Ok(CacheStrategy::new(definition.name.clone(), subs))
    }

    /// Resolve every definition into the named set used by scripts.
    pub fn build_all<'a, I>(
        &self,
        definitions: I,
        policy: &CookiePolicy,
    ) -> Result<StrategySet, StrategyError>
    where
        I: IntoIterator<Item = &'a StrategyDefinition>,
    {
        let mut set = StrategySet::default();
        for definition in definitions {
            set.insert(self.build(definition, policy)?);
        }
        Ok(set)
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("StrategyRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

/// Built strategies by name.
#[derive(Debug, Clone, Default)]
pub struct StrategySet {
    strategies: HashMap<String, Arc<CacheStrategy>>,
}

impl StrategySet {
    pub fn insert(&mut self, strategy: CacheStrategy) {
        self.strategies
            .insert(strategy.name().to_string(), Arc::new(strategy));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CacheStrategy>> {
        self.strategies.get(name)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::application::{
        engine::tests::{empty_script, test_engine},
        request::{Request, StateValue},
    };

    use super::*;

    fn context(request: Request) -> Arc<Context> {
        let engine = test_engine();
        let script = empty_script(&engine);
        Context::new(engine, script, request)
    }

    fn build(parts: Vec<PartSpec>) -> Result<CacheStrategy, StrategyError> {
        StrategyRegistry::builtin().build(
            &StrategyDefinition {
                name: "test".to_string(),
                parts,
            },
            &CookiePolicy::default(),
        )
    }

    #[test]
    fn sorted_query_keys_ignore_argument_order() {
        let strategy = build(vec![PartSpec::new("query", "")]).expect("strategy");
        let first = context(Request::from_url("/?b=2&a=1").expect("url"));
        let second = context(Request::from_url("/?a=1&b=2").expect("url"));

        assert_eq!(strategy.create_key(&first), strategy.create_key(&second));
        assert!(strategy.create_key(&first).ends_with("|a=1&b=2"));
    }

    #[test]
    fn unsorted_query_keeps_request_order() {
        let strategy = build(vec![PartSpec::new("query", "").unsorted()]).expect("strategy");
        let ctx = context(Request::from_url("/?b=2&a=1").expect("url"));
        assert!(strategy.create_key(&ctx).ends_with("|b=2&a=1"));
    }

    #[test]
    fn query_lists_select_or_exclude_arguments() {
        let listed = build(vec![PartSpec::new("query", "a, c")]).expect("strategy");
        let excluded = build(vec![PartSpec::new("query", "a").except()]).expect("strategy");
        let ctx = context(Request::from_url("/?a=1&b=2&c=3&=skip").expect("url"));

        assert!(listed.create_key(&ctx).ends_with("|a=1&c=3"));
        assert!(excluded.create_key(&ctx).ends_with("|b=2&c=3"));
    }

    #[test]
    fn except_without_names_is_rejected() {
        let err = build(vec![PartSpec::new("query", " ").except()]).expect_err("invalid");
        assert!(matches!(err, StrategyError::Invalid { .. }));
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let err = build(vec![PartSpec::new("geo", "")]).expect_err("unknown");
        assert_eq!(
            err,
            StrategyError::UnknownKind {
                strategy: "test".to_string(),
                kind: "geo".to_string()
            }
        );
    }

    #[test]
    fn cookie_keys_skip_absent_cookies() {
        let strategy = build(vec![PartSpec::new("cookie", "lang region")]).expect("strategy");
        let ctx = context(
            Request::from_url("/")
                .expect("url")
                .with_cookie("lang", "en")
                .with_cookie("session", "secret"),
        );
        let key = strategy.create_key(&ctx);
        assert!(key.ends_with("|lang:en"));
        assert!(!key.contains("secret"));
    }

    #[test]
    fn query_values_cannot_imitate_other_arguments() {
        let strategy = build(vec![PartSpec::new("query", "")]).expect("strategy");
        let split = context(Request::from_url("/?a=1&b=2").expect("url"));
        let packed = context(Request::from_url("/?a=1%26b%3D2").expect("url"));

        assert_ne!(strategy.create_key(&split), strategy.create_key(&packed));
        assert!(strategy.create_key(&packed).ends_with(r"|a=1\\&b\\=2"));
    }

    #[test]
    fn cookie_values_cannot_imitate_other_cookies() {
        let strategy = build(vec![PartSpec::new("cookie", "a b")]).expect("strategy");
        let split = context(
            Request::from_url("/")
                .expect("url")
                .with_cookie("a", "x")
                .with_cookie("b", "y"),
        );
        let packed = context(Request::from_url("/").expect("url").with_cookie("a", "x|b:y"));

        assert_ne!(strategy.create_key(&split), strategy.create_key(&packed));
    }

    #[test]
    fn denied_cookies_fail_at_configuration_time() {
        let policy = CookiePolicy {
            deny_cookies: BTreeSet::from(["session".to_string()]),
            ..CookiePolicy::default()
        };
        let err = StrategyRegistry::builtin()
            .build(
                &StrategyDefinition {
                    name: "by-cookie".to_string(),
                    parts: vec![PartSpec::new("cookie", "session")],
                },
                &policy,
            )
            .expect_err("denied");
        assert!(matches!(err, StrategyError::Invalid { .. }));
    }

    #[test]
    fn no_cache_parts_mark_the_root_context() {
        let strategy = build(vec![
            PartSpec::new("query", ""),
            PartSpec::new("no-cache-state", "preview"),
        ])
        .expect("strategy");
        let ctx = context(Request::from_url("/").expect("url"));

        strategy.init_context(&ctx);
        assert!(!ctx.no_cache());

        ctx.state().set("preview", StateValue::Bool(true));
        strategy.init_context(&ctx);
        assert!(ctx.no_cache());
    }

    #[test]
    fn missing_required_cookie_disables_caching() {
        let strategy = build(vec![PartSpec::new("no-cache-cookie", "uid")]).expect("strategy");
        let anonymous = context(Request::from_url("/").expect("url"));
        let known = context(Request::from_url("/").expect("url").with_cookie("uid", "7"));

        assert!(strategy.no_cache(&anonymous));
        assert!(!strategy.no_cache(&known));
    }

    #[test]
    fn signatures_separate_differently_declared_strategies() {
        let by_a = build(vec![PartSpec::new("query", "a")]).expect("strategy");
        let by_all = build(vec![PartSpec::new("query", "")]).expect("strategy");
        let ctx = context(Request::from_url("/?a=1").expect("url"));

        assert_ne!(by_a.create_key(&ctx), by_all.create_key(&ctx));
    }
}
