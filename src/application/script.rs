//! Scripts: a parsed XML page template whose block elements are executed and
//! replaced by their results.
//!
//! A script is parsed once and shared by every context that runs it. Running
//! it clones the parsed document; since cloning preserves node ids, each
//! block's node in the copy is addressed directly by the id recorded at parse
//! time.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc2822};
use tracing::{debug, instrument, warn};

use crate::{
    cache::{CacheStrategy, StrategySet},
    domain::{
        document::{Document, Element, NodeId, NodeKind},
        error::DomainError,
        path::{PathExpr, Selection},
        tag::{TagKey, TagKeyBuilder, saturating_after},
    },
};

use super::{
    block::{
        BLOCK_NAMESPACE, Block, BlockDeclaration, BlockError, BlockInfo, BlockRegistry, Guard,
        GuardKind, Param, ParamKind, TagPolicy,
    },
    context::{Context, ContextError, ContextStopper},
    dispatch::invoke_block,
    engine::EngineConfig,
    invoke::InvokeContext,
    request::STATUS_OK,
};

const SOURCE: &str = "application::script";
const PROPERTY_ELEMENT: &str = "xscript";
const PARAM_ELEMENT: &str = "param";
const META_ELEMENT: &str = "meta";
const STYLESHEET_TARGET: &str = "xml-stylesheet";
const DEFAULT_EXPIRE_TIME_DELTA: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown block `{name}`")]
    UnknownBlock { name: String },
    #[error("invalid block `{block}`: {reason}")]
    InvalidBlock { block: String, reason: String },
    #[error("invalid script property `{name}`: {reason}")]
    InvalidProperty { name: String, reason: String },
    #[error("method `{method}` is not allowed")]
    MethodNotAllowed { method: String },
    #[error("unknown cache strategy `{name}`")]
    UnknownStrategy { name: String },
    #[error("cannot stat stylesheet `{path}`: {source}")]
    Stylesheet {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("internal script error: {message}")]
    Internal { message: String },
}

impl ScriptError {
    pub fn invalid_block(block: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidBlock {
            block: block.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_property(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProperty {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// What a script parse may resolve against.
#[derive(Clone, Copy)]
pub struct ParseEnv<'a> {
    pub blocks: &'a BlockRegistry,
    pub strategies: &'a StrategySet,
    /// Directory relative block sources and stylesheets resolve against.
    pub base_dir: Option<&'a Path>,
    pub default_timeout: Duration,
    pub default_cache_time: Duration,
}

impl<'a> ParseEnv<'a> {
    pub fn with_base_dir<'b>(&self, base_dir: Option<&'b Path>) -> ParseEnv<'b>
    where
        'a: 'b,
    {
        ParseEnv {
            blocks: self.blocks,
            strategies: self.strategies,
            base_dir,
            default_timeout: self.default_timeout,
            default_cache_time: self.default_cache_time,
        }
    }

    /// Resolve `path` against the base directory unless it is absolute.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl fmt::Debug for ParseEnv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParseEnv")
            .field("base_dir", &self.base_dir)
            .field("default_timeout", &self.default_timeout)
            .field("default_cache_time", &self.default_cache_time)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ScriptProperties {
    pub all_threaded: bool,
    /// Upper-case request methods; empty allows every method.
    pub allow_methods: Vec<String>,
    pub expire_time_delta: Duration,
    pub cache_time: Option<Duration>,
    pub xslt_dont_apply: bool,
    pub binary_page: bool,
    pub strategy: Option<Arc<CacheStrategy>>,
    pub headers: Vec<(String, String)>,
}

impl Default for ScriptProperties {
    fn default() -> Self {
        Self {
            all_threaded: false,
            allow_methods: Vec::new(),
            expire_time_delta: DEFAULT_EXPIRE_TIME_DELTA,
            cache_time: None,
            xslt_dont_apply: false,
            binary_page: false,
            strategy: None,
            headers: Vec::new(),
        }
    }
}

pub struct Script {
    name: String,
    path: Option<PathBuf>,
    base_dir: Option<PathBuf>,
    modified: Option<OffsetDateTime>,
    document: Document,
    blocks: Vec<Arc<dyn Block>>,
    property_nodes: Vec<NodeId>,
    stylesheet: Option<String>,
    properties: ScriptProperties,
}

impl Script {
    pub fn parse(name: &str, source: &str, env: &ParseEnv<'_>) -> Result<Self, ScriptError> {
        Self::from_document(name, Document::parse(source)?, env)
    }

    /// Read and parse a script file, remembering its path and mtime.
    pub async fn load(path: &Path, env: &ParseEnv<'_>) -> Result<Self, ScriptError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|err| ScriptError::io(path, err))?;
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| ScriptError::io(path, err))?;

        let env = env.with_base_dir(path.parent());
        let mut script = Self::parse(&path.to_string_lossy(), &source, &env)?;
        script.path = Some(path.to_path_buf());
        script.modified = file_mtime(&metadata);
        Ok(script)
    }

    pub fn from_document(
        name: &str,
        mut document: Document,
        env: &ParseEnv<'_>,
    ) -> Result<Self, ScriptError> {
        let stylesheet = take_stylesheet(&mut document)?;
        let (block_nodes, property_nodes) = collect_nodes(&document);

        let mut properties = ScriptProperties::default();
        for &node in property_nodes.iter().rev() {
            apply_properties(&document, node, env, &mut properties)?;
        }

        let mut blocks = Vec::with_capacity(block_nodes.len());
        for node in block_nodes {
            let declaration = declare_block(&document, node, env, &properties)?;
            let kind = declaration.info.kind.clone();
            let factory = env
                .blocks
                .get(&kind)
                .ok_or_else(|| ScriptError::UnknownBlock { name: kind.clone() })?;
            blocks.push(factory.create(declaration, env)?);
        }

        debug!(
            target = SOURCE,
            script = name,
            blocks = blocks.len(),
            stylesheet = stylesheet.as_deref().unwrap_or_default(),
            "Parsed script"
        );

        Ok(Self {
            name: name.to_string(),
            path: None,
            base_dir: env.base_dir.map(Path::to_path_buf),
            modified: None,
            document,
            blocks,
            property_nodes,
            stylesheet,
            properties,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    pub fn modified(&self) -> Option<OffsetDateTime> {
        self.modified
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn blocks(&self) -> &[Arc<dyn Block>] {
        &self.blocks
    }

    pub fn stylesheet(&self) -> Option<&str> {
        self.stylesheet.as_deref()
    }

    pub fn properties(&self) -> &ScriptProperties {
        &self.properties
    }

    /// Run every block of the script in `ctx` and assemble the result.
    #[instrument(skip_all, fields(request_id = %ctx.id(), script = %self.name))]
    pub async fn invoke(&self, ctx: &Arc<Context>) -> Result<Document, ScriptError> {
        if !std::ptr::eq(Arc::as_ptr(ctx.script()), self) {
            return Err(ScriptError::internal(
                "context was created for a different script",
            ));
        }
        let method = ctx.request().method();
        if !self.properties.allow_methods.is_empty()
            && !self.properties.allow_methods.iter().any(|m| m == method)
        {
            return Err(ScriptError::MethodNotAllowed {
                method: method.to_string(),
            });
        }

        ctx.expect(self.blocks.len())?;
        let _stopper = ContextStopper::new(Arc::clone(ctx));
        if let Some(strategy) = &self.properties.strategy {
            strategy.init_context(ctx);
        }

        let timeout = self.invoke_timeout(ctx);
        for (index, block) in self.blocks.iter().enumerate() {
            let info = block.info();
            if ctx.halted() {
                ctx.set_result(index, InvokeContext::skipped())?;
                continue;
            }
            if !info.guard_allows(ctx) {
                ctx.set_result(index, InvokeContext::not_executed())?;
                continue;
            }
            if info.threaded && !ctx.force_no_threaded() {
                tokio::spawn(invoke_block(Arc::clone(ctx), index));
            } else {
                invoke_block(Arc::clone(ctx), index).await;
            }
        }

        ctx.wait(timeout).await?;
        if let Some(err) = ctx.take_critical() {
            return Err(ScriptError::Block(err));
        }

        if ctx.parent().is_none() {
            self.add_headers(ctx);
        }
        self.process_results(ctx)
    }

    /// Longest threaded block timeout, bounded by the request deadline.
    fn invoke_timeout(&self, ctx: &Context) -> Duration {
        if ctx.force_no_threaded() {
            return Duration::ZERO;
        }
        self.blocks
            .iter()
            .map(|block| block.info())
            .filter(|info| info.threaded)
            .map(|info| info.timeout)
            .max()
            .unwrap_or(Duration::ZERO)
            .min(ctx.root().timer().remained())
    }

    pub(crate) fn add_headers(&self, ctx: &Context) {
        let response = ctx.response();
        for (name, value) in &self.properties.headers {
            response.set_header(name, value.as_str());
        }
        let expires =
            saturating_after(OffsetDateTime::now_utc(), self.properties.expire_time_delta);
        match expires.format(&Rfc2822) {
            Ok(value) => response.set_header("Expires", value),
            Err(err) => warn!(target = SOURCE, error = %err, "Failed to format Expires header"),
        }
    }

    /// Substitute every block result into a copy of the parsed document.
    pub fn process_results(&self, ctx: &Context) -> Result<Document, ScriptError> {
        let mut doc = self.document.clone();

        for (index, block) in self.blocks.iter().enumerate() {
            let info = block.info();
            let node = info.node;
            let original = self.document.element(node).ok_or_else(|| {
                ScriptError::internal(format!("block node {node} is not an element"))
            })?;
            match doc.element(node) {
                Some(copy) if copy.name == original.name && doc.is_attached(node) => {}
                Some(copy) => {
                    return Err(ScriptError::internal(format!(
                        "block node {node} is `{}` in the copy, expected `{}`",
                        copy.name, original.name
                    )));
                }
                None => {
                    return Err(ScriptError::internal(format!(
                        "block node {node} is missing from the copy"
                    )));
                }
            }

            let result = ctx
                .result(index)
                .ok_or_else(|| ScriptError::internal(format!("result slot {index} is empty")))?;

            if let Some(meta) = result.meta() {
                if let Some(root) = meta.root_element() {
                    let imported = doc.import_subtree(meta, root);
                    doc.insert_after(node, &[imported]);
                }
            }

            let replacement = substitution(&mut doc, info, &result);
            doc.replace_with(node, &replacement);
        }

        for &node in &self.property_nodes {
            doc.remove(node);
        }
        Ok(doc)
    }

    /// Whether the assembled page may be stored in the page cache.
    pub fn cachable(&self, config: &EngineConfig, ctx: Option<&Context>) -> bool {
        if self.properties.binary_page {
            return false;
        }
        let Some(cache_time) = self.properties.cache_time else {
            return false;
        };
        if cache_time <= config.cache.minimal_cache_time() {
            return false;
        }
        let Some(ctx) = ctx else {
            return true;
        };
        if ctx.no_cache() || ctx.response().status() != STATUS_OK {
            return false;
        }
        ctx.response()
            .cookies()
            .iter()
            .all(|(name, _)| config.policy.allows_caching(name))
    }

    /// Page-store key: the request URL, script and stylesheet modification
    /// times, per-block stylesheets and the page strategy key.
    pub async fn create_tag_key(&self, ctx: &Context) -> Result<TagKey, ScriptError> {
        let mut builder = TagKeyBuilder::new("page")
            .push(ctx.request().url())
            .push(&self.name)
            .push_time(self.modified);

        if let Some(stylesheet) = &self.stylesheet {
            let path = self.resolve(stylesheet);
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|source| ScriptError::Stylesheet {
                    path: path.clone(),
                    source,
                })?;
            builder = builder
                .push(stylesheet)
                .push_time(file_mtime(&metadata));
        }

        for block in &self.blocks {
            if let Some(xslt) = &block.info().xslt {
                builder = builder.push(xslt);
            }
        }
        if let Some(strategy) = &self.properties.strategy {
            builder = builder.push(strategy.create_key(ctx));
        }
        Ok(builder.finish())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("blocks", &self.blocks.len())
            .field("stylesheet", &self.stylesheet)
            .finish_non_exhaustive()
    }
}

/// Nodes (imported into `doc`) that take the place of the block element.
fn substitution(doc: &mut Document, info: &BlockInfo, result: &InvokeContext) -> Vec<NodeId> {
    let source = result.doc();
    if !result.is_success() {
        return source
            .root_element()
            .map(|root| vec![doc.import_subtree(source, root)])
            .unwrap_or_default();
    }

    match &info.xpointer {
        Some(xpointer) if xpointer.is_strip() => Vec::new(),
        Some(xpointer) => xpointer
            .select(source)
            .into_iter()
            .map(|selection| match selection {
                Selection::Node(node) => doc.import_subtree(source, node),
                Selection::Attribute { value, .. } => doc.create_text(value),
            })
            .collect(),
        None => source
            .root_element()
            .map(|root| vec![doc.import_subtree(source, root)])
            .unwrap_or_default(),
    }
}

fn take_stylesheet(document: &mut Document) -> Result<Option<String>, ScriptError> {
    let top = document.document_node();
    let found = document.children(top).iter().copied().find_map(|id| {
        match document.kind(id) {
            NodeKind::ProcessingInstruction { target, content } if target == STYLESHEET_TARGET => {
                Some((id, pseudo_attribute(content, "href")))
            }
            _ => None,
        }
    });

    let Some((node, href)) = found else {
        return Ok(None);
    };
    document.remove(node);
    match href {
        Some(href) if !href.is_empty() => Ok(Some(href)),
        _ => Err(ScriptError::invalid_property(
            STYLESHEET_TARGET,
            "empty stylesheet href",
        )),
    }
}

/// Value of `name="..."` inside processing-instruction content.
fn pseudo_attribute(content: &str, name: &str) -> Option<String> {
    let mut rest = content;
    while let Some(position) = rest.find(name) {
        let after = rest[position + name.len()..].trim_start();
        let preceded_by_word = rest[..position]
            .chars()
            .next_back()
            .is_some_and(|ch| ch.is_alphanumeric() || ch == '-');
        if let (false, Some(value)) = (preceded_by_word, after.strip_prefix('=')) {
            let value = value.trim_start();
            let quote = value.chars().next()?;
            if quote == '"' || quote == '\'' {
                let body = &value[1..];
                return body.find(quote).map(|end| body[..end].to_string());
            }
        }
        rest = &rest[position + name.len()..];
    }
    None
}

fn is_block_namespace(element: &Element) -> bool {
    element.namespace.as_deref() == Some(BLOCK_NAMESPACE)
}

/// Block and property nodes in document order. Neither is descended into.
fn collect_nodes(document: &Document) -> (Vec<NodeId>, Vec<NodeId>) {
    let mut blocks = Vec::new();
    let mut properties = Vec::new();
    let mut pending: Vec<NodeId> = document
        .children(document.document_node())
        .iter()
        .rev()
        .copied()
        .collect();

    while let Some(node) = pending.pop() {
        let Some(element) = document.element(node) else {
            continue;
        };
        if is_block_namespace(element) {
            if element.local_name() == PROPERTY_ELEMENT {
                properties.push(node);
            } else {
                blocks.push(node);
            }
            continue;
        }
        pending.extend(document.children(node).iter().rev().copied());
    }
    (blocks, properties)
}

fn parse_flag(name: &str, value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        other => Err(format!("`{name}` expects yes/no, got `{other}`")),
    }
}

fn parse_seconds(name: &str, value: &str) -> Result<Duration, String> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| format!("`{name}` expects seconds, got `{value}`"))
}

fn is_namespace_declaration(name: &str) -> bool {
    name == "xmlns" || name.starts_with("xmlns:")
}

fn apply_properties(
    document: &Document,
    node: NodeId,
    env: &ParseEnv<'_>,
    properties: &mut ScriptProperties,
) -> Result<(), ScriptError> {
    let Some(element) = document.element(node) else {
        return Ok(());
    };
    for attr in &element.attributes {
        if is_namespace_declaration(&attr.name) {
            continue;
        }
        apply_property(&attr.name, &attr.value, env, properties)?;
    }

    for &child in document.children(node) {
        let Some(element) = document.element(child) else {
            continue;
        };
        let name = element.local_name();
        if name == "add-headers" {
            for &header in document.children(child) {
                let Some(header) = document.element(header) else {
                    continue;
                };
                if header.local_name() != "header" {
                    return Err(ScriptError::invalid_property(
                        "add-headers",
                        format!("unexpected element `{}`", header.name),
                    ));
                }
                let (Some(name), Some(value)) = (header.attribute("name"), header.attribute("value"))
                else {
                    return Err(ScriptError::invalid_property(
                        "add-headers",
                        "header needs `name` and `value`",
                    ));
                };
                properties.headers.push((name.to_string(), value.to_string()));
            }
            continue;
        }
        let value = document.text_content(child);
        apply_property(name, value.trim(), env, properties)?;
    }
    Ok(())
}

fn apply_property(
    name: &str,
    value: &str,
    env: &ParseEnv<'_>,
    properties: &mut ScriptProperties,
) -> Result<(), ScriptError> {
    let invalid = |reason: String| ScriptError::invalid_property(name, reason);
    match name {
        "all-threaded" => properties.all_threaded = parse_flag(name, value).map_err(invalid)?,
        "allow-methods" => {
            properties.allow_methods = value
                .split(|ch: char| ch == ',' || ch.is_whitespace())
                .filter(|method| !method.is_empty())
                .map(str::to_ascii_uppercase)
                .collect();
        }
        "http-expire-time-delta" => {
            properties.expire_time_delta = parse_seconds(name, value).map_err(invalid)?;
        }
        "cache-time" => properties.cache_time = Some(parse_seconds(name, value).map_err(invalid)?),
        "xslt-dont-apply" => {
            properties.xslt_dont_apply = parse_flag(name, value).map_err(invalid)?;
        }
        "binary-page" => properties.binary_page = parse_flag(name, value).map_err(invalid)?,
        "cache-strategy" => {
            let strategy = env
                .strategies
                .get(value)
                .ok_or_else(|| ScriptError::UnknownStrategy {
                    name: value.to_string(),
                })?;
            properties.strategy = Some(Arc::clone(strategy));
        }
        _ => return Err(invalid("unknown property".to_string())),
    }
    Ok(())
}

fn declare_block(
    document: &Document,
    node: NodeId,
    env: &ParseEnv<'_>,
    properties: &ScriptProperties,
) -> Result<BlockDeclaration, ScriptError> {
    let element = document
        .element(node)
        .ok_or_else(|| ScriptError::internal(format!("block node {node} is not an element")))?;
    let kind = element.local_name().to_string();
    let invalid = |reason: String| ScriptError::invalid_block(&kind, reason);

    let mut info = BlockInfo::new(&kind, element.attribute("method").unwrap_or_default(), node);
    info.id = element.attribute("id").map(str::to_string);
    info.threaded = match element.attribute("threaded") {
        Some(value) => parse_flag("threaded", value).map_err(invalid)?,
        None => properties.all_threaded,
    };
    info.timeout = match element.attribute("timeout") {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| invalid(format!("`timeout` expects milliseconds, got `{value}`")))?,
        None => env.default_timeout,
    };
    if let Some(expression) = element.attribute("xpointer") {
        info.xpointer = Some(PathExpr::compile(expression)?);
    }
    info.guard = guard(element).map_err(invalid)?;
    info.tag = match element.attribute("tag") {
        None => None,
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "no" | "false" => None,
            "yes" | "true" => Some(TagPolicy {
                cache_time: env.default_cache_time,
            }),
            _ => Some(TagPolicy {
                cache_time: parse_seconds("tag", value).map_err(invalid)?,
            }),
        },
    };
    if let Some(name) = element.attribute("cache-strategy") {
        let strategy = env
            .strategies
            .get(name)
            .ok_or_else(|| ScriptError::UnknownStrategy {
                name: name.to_string(),
            })?;
        info.strategy = Some(Arc::clone(strategy));
    }
    info.xslt = element.attribute("xslt").map(str::to_string);

    let mut content = None;
    for &child in document.children(node) {
        let Some(child_element) = document.element(child) else {
            continue;
        };
        let own_namespace = child_element.namespace.is_none() || is_block_namespace(child_element);
        match child_element.local_name() {
            PARAM_ELEMENT if own_namespace => {
                info.params.push(param(document, child, child_element).map_err(invalid)?);
            }
            META_ELEMENT if own_namespace => info.meta = true,
            _ if content.is_none() => {
                let mut fragment = Document::new();
                let imported = fragment.import_subtree(document, child);
                let top = fragment.document_node();
                fragment.append_child(top, imported);
                content = Some(fragment);
            }
            _ => {}
        }
    }

    Ok(BlockDeclaration { info, content })
}

fn guard(element: &Element) -> Result<Option<Guard>, String> {
    let (name, negate) = match (element.attribute("guard"), element.attribute("guard-not")) {
        (Some(_), Some(_)) => return Err("`guard` and `guard-not` are exclusive".to_string()),
        (Some(name), None) => (name, false),
        (None, Some(name)) => (name, true),
        (None, None) => return Ok(None),
    };
    let kind = match element.attribute("guard-type") {
        Some(kind) => kind.parse::<GuardKind>()?,
        None => GuardKind::default(),
    };
    Ok(Some(Guard {
        kind,
        name: name.to_string(),
        negate,
    }))
}

fn param(document: &Document, node: NodeId, element: &Element) -> Result<Param, String> {
    let kind = match element.attribute("type") {
        Some(kind) => kind.parse::<ParamKind>()?,
        None => ParamKind::String,
    };
    let value = document.text_content(node).trim().to_string();
    match kind {
        ParamKind::Long if value.parse::<i64>().is_err() => {
            return Err(format!("`{value}` is not a valid Long param"));
        }
        ParamKind::Boolean if parse_flag("Boolean", &value).is_err() => {
            return Err(format!("`{value}` is not a valid Boolean param"));
        }
        _ => {}
    }
    Ok(Param {
        id: element.attribute("id").map(str::to_string),
        kind,
        value,
        default: element.attribute("default").map(str::to_string),
    })
}

/// Modification time of a file, if it can be determined.
pub(crate) fn file_mtime(metadata: &std::fs::Metadata) -> Option<OffsetDateTime> {
    metadata
        .modified()
        .ok()
        .filter(|at| *at > SystemTime::UNIX_EPOCH)
        .map(OffsetDateTime::from)
}
