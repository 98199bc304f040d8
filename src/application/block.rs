//! Block contract: a unit that produces a document for a context, plus the
//! declaration data parsed from its script element.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    cache::CacheStrategy,
    domain::{
        document::{Document, Element, NodeId},
        path::PathExpr,
        tag::{TagKey, TagKeyBuilder},
    },
};

use super::{
    context::Context,
    invoke::{ArgList, InvokeContext, Outcome},
    script::{ParseEnv, ScriptError},
};

/// Namespace binding script elements to block implementations.
pub const BLOCK_NAMESPACE: &str = "urn:tessera:block";

const ERROR_ELEMENT: &str = "xscript_invoke_failed";

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block `{block}` failed: {message}")]
    Recoverable { block: String, message: String },
    #[error("critical failure in block `{block}`: {message}")]
    Critical { block: String, message: String },
}

impl BlockError {
    pub fn recoverable(info: &BlockInfo, message: impl Into<String>) -> Self {
        Self::Recoverable {
            block: info.identity(),
            message: message.into(),
        }
    }

    pub fn critical(info: &BlockInfo, message: impl Into<String>) -> Self {
        Self::Critical {
            block: info.identity(),
            message: message.into(),
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Recoverable { message, .. } | Self::Critical { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Long,
    Boolean,
    QueryArg,
    Cookie,
    StateArg,
    LocalArg,
    Header,
}

impl FromStr for ParamKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "string" => Ok(Self::String),
            "long" => Ok(Self::Long),
            "boolean" => Ok(Self::Boolean),
            "queryarg" => Ok(Self::QueryArg),
            "cookie" => Ok(Self::Cookie),
            "statearg" => Ok(Self::StateArg),
            "localarg" => Ok(Self::LocalArg),
            "header" => Ok(Self::Header),
            other => Err(format!("unknown param type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub id: Option<String>,
    pub kind: ParamKind,
    /// Literal value, or the name of the variable to read.
    pub value: String,
    pub default: Option<String>,
}

impl Param {
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: ParamKind::String,
            value: value.into(),
            default: None,
        }
    }

    pub fn evaluate(&self, ctx: &Context) -> String {
        let resolved = match self.kind {
            ParamKind::String | ParamKind::Long | ParamKind::Boolean => {
                return self.value.clone();
            }
            ParamKind::QueryArg => ctx.request().query_arg(&self.value).map(str::to_string),
            ParamKind::Cookie => ctx.request().cookie(&self.value).map(str::to_string),
            ParamKind::Header => ctx.request().header(&self.value).map(str::to_string),
            ParamKind::StateArg => ctx.state().get(&self.value).map(|value| value.to_string()),
            ParamKind::LocalArg => ctx.local_param(&self.value).map(str::to_string),
        };
        resolved
            .or_else(|| self.default.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardKind {
    #[default]
    StateArg,
    QueryArg,
    Cookie,
    LocalArg,
}

impl FromStr for GuardKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "statearg" => Ok(Self::StateArg),
            "queryarg" => Ok(Self::QueryArg),
            "cookie" => Ok(Self::Cookie),
            "localarg" => Ok(Self::LocalArg),
            other => Err(format!("unknown guard type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub kind: GuardKind,
    pub name: String,
    pub negate: bool,
}

impl Guard {
    pub fn allows(&self, ctx: &Context) -> bool {
        let present = match self.kind {
            GuardKind::StateArg => ctx.state().is(&self.name),
            GuardKind::QueryArg => ctx
                .request()
                .query_arg(&self.name)
                .is_some_and(|value| !value.is_empty()),
            GuardKind::Cookie => ctx
                .request()
                .cookie(&self.name)
                .is_some_and(|value| !value.is_empty()),
            GuardKind::LocalArg => ctx
                .local_param(&self.name)
                .is_some_and(|value| !value.is_empty()),
        };
        present != self.negate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagPolicy {
    pub cache_time: Duration,
}

/// Everything parsed from a block element that the engine itself needs.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub kind: String,
    pub id: Option<String>,
    pub method: String,
    pub node: NodeId,
    pub params: Vec<Param>,
    pub guard: Option<Guard>,
    pub xpointer: Option<PathExpr>,
    pub threaded: bool,
    pub timeout: Duration,
    pub tag: Option<TagPolicy>,
    pub strategy: Option<Arc<CacheStrategy>>,
    pub meta: bool,
    pub xslt: Option<String>,
}

impl BlockInfo {
    pub fn new(kind: impl Into<String>, method: impl Into<String>, node: NodeId) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            method: method.into(),
            node,
            params: Vec::new(),
            guard: None,
            xpointer: None,
            threaded: false,
            timeout: Duration::from_secs(5),
            tag: None,
            strategy: None,
            meta: false,
            xslt: None,
        }
    }

    /// `kind` plus the block id when present, falling back to the method.
    pub fn identity(&self) -> String {
        match &self.id {
            Some(id) => format!("{}#{id}", self.kind),
            None => format!("{}:{}", self.kind, self.method),
        }
    }

    pub fn guard_allows(&self, ctx: &Context) -> bool {
        self.guard.as_ref().is_none_or(|guard| guard.allows(ctx))
    }

    pub fn evaluate_args(&self, ctx: &Context) -> ArgList {
        self.params.iter().map(|param| param.evaluate(ctx)).collect()
    }
}

#[async_trait]
pub trait Block: Send + Sync + fmt::Debug {
    fn info(&self) -> &BlockInfo;

    /// Produce the block document into `invoke`.
    async fn call(&self, ctx: &Arc<Context>, invoke: &mut InvokeContext) -> Result<(), BlockError>;

    fn is_tag_capable(&self) -> bool {
        self.info().tag.is_some()
    }

    fn create_tag_key(&self, ctx: &Context, invoke: &InvokeContext) -> TagKey {
        default_tag_key(self.info(), ctx, invoke)
    }

    fn error_result(&self, message: &str) -> InvokeContext {
        let outcome = if message == "timed out" {
            Outcome::TimedOut
        } else {
            Outcome::Failed
        };
        InvokeContext::failed(error_document(self.info(), message), outcome)
    }
}

/// Key covering block identity, method, evaluated arguments, the strategy
/// key and the block position in its script.
pub fn default_tag_key(info: &BlockInfo, ctx: &Context, invoke: &InvokeContext) -> TagKey {
    let mut builder = TagKeyBuilder::new(&info.kind).push(&info.method);
    for arg in invoke.args().iter() {
        builder = builder.push(arg);
    }
    if let Some(strategy) = &info.strategy {
        builder = builder.push(strategy.create_key(ctx));
    }
    builder
        .push(ctx.script().name())
        .push(info.node.to_string())
        .finish()
}

pub fn error_document(info: &BlockInfo, message: &str) -> Document {
    let mut element = Element::new(ERROR_ELEMENT)
        .with_attribute("error", message)
        .with_attribute("block", &info.kind)
        .with_attribute("method", &info.method);
    if let Some(id) = &info.id {
        element.set_attribute("id", id);
    }
    Document::with_root(element)
}

/// Parsed block element handed to a factory.
#[derive(Debug, Clone)]
pub struct BlockDeclaration {
    pub info: BlockInfo,
    /// First element child that is not a `param` or `meta` declaration.
    pub content: Option<Document>,
}

pub trait BlockFactory: Send + Sync {
    fn create(
        &self,
        declaration: BlockDeclaration,
        env: &ParseEnv<'_>,
    ) -> Result<Arc<dyn Block>, ScriptError>;
}

/// Block factories by element local name.
#[derive(Clone, Default)]
pub struct BlockRegistry {
    factories: HashMap<String, Arc<dyn BlockFactory>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: impl BlockFactory + 'static) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn BlockFactory>> {
        self.factories.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRegistry")
            .field("blocks", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::application::{
        engine::tests::{empty_script, test_engine},
        request::{Request, StateValue},
    };

    use super::*;

    fn context(url: &str) -> Arc<Context> {
        let engine = test_engine();
        let script = empty_script(&engine);
        Context::new(engine, script, Request::from_url(url).expect("valid url"))
    }

    #[test]
    fn params_resolve_against_request_and_state() {
        let ctx = context("/?page=3");
        ctx.state().set("user", StateValue::String("ann".to_string()));

        let query = Param {
            id: None,
            kind: ParamKind::QueryArg,
            value: "page".to_string(),
            default: None,
        };
        let state = Param {
            kind: ParamKind::StateArg,
            value: "user".to_string(),
            ..query.clone()
        };
        let missing = Param {
            value: "absent".to_string(),
            default: Some("fallback".to_string()),
            ..query.clone()
        };

        assert_eq!(query.evaluate(&ctx), "3");
        assert_eq!(state.evaluate(&ctx), "ann");
        assert_eq!(missing.evaluate(&ctx), "fallback");
        assert_eq!(Param::literal("x").evaluate(&ctx), "x");
    }

    #[test]
    fn guards_honour_negation() {
        let ctx = context("/?preview=1");
        let guard = Guard {
            kind: GuardKind::QueryArg,
            name: "preview".to_string(),
            negate: false,
        };
        let inverted = Guard {
            negate: true,
            ..guard.clone()
        };
        let state_guard = Guard {
            kind: GuardKind::StateArg,
            name: "logged_in".to_string(),
            negate: false,
        };

        assert!(guard.allows(&ctx));
        assert!(!inverted.allows(&ctx));
        assert!(!state_guard.allows(&ctx));
        ctx.state().set("logged_in", StateValue::Bool(true));
        assert!(state_guard.allows(&ctx));
    }

    #[test]
    fn param_kinds_parse_case_insensitively() {
        assert_eq!("QueryArg".parse::<ParamKind>(), Ok(ParamKind::QueryArg));
        assert_eq!("statearg".parse::<ParamKind>(), Ok(ParamKind::StateArg));
        assert!("Bogus".parse::<ParamKind>().is_err());
        assert_eq!("Cookie".parse::<GuardKind>(), Ok(GuardKind::Cookie));
    }

    #[test]
    fn error_document_names_the_block() {
        let mut info = BlockInfo::new("file", "load", Document::new().document_node());
        info.id = Some("news".to_string());

        let doc = error_document(&info, "boom");
        assert_eq!(
            doc.to_xml(),
            r#"<xscript_invoke_failed error="boom" block="file" method="load" id="news"/>"#
        );
        assert_eq!(info.identity(), "file#news");
    }
}
