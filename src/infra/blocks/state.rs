//! `state` block: read and write request state variables.

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;

use crate::{
    application::{
        block::{Block, BlockDeclaration, BlockError, BlockFactory, BlockInfo},
        context::Context,
        invoke::{ArgList, InvokeContext},
        request::StateValue,
        script::{ParseEnv, ScriptError},
    },
    domain::document::{Document, Element},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    SetString,
    SetLong,
    SetBool,
    SetDefault,
    Drop,
    Dump,
    EchoQuery,
}

impl Method {
    fn arity(self) -> usize {
        match self {
            Self::SetString | Self::SetLong | Self::SetBool | Self::SetDefault => 2,
            Self::Drop | Self::Dump | Self::EchoQuery => 0,
        }
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "set_string" | "setStateString" => Ok(Self::SetString),
            "set_long" | "setStateLong" => Ok(Self::SetLong),
            "set_bool" | "setStateBoolean" => Ok(Self::SetBool),
            "set_default" | "setStateDefault" => Ok(Self::SetDefault),
            "drop" | "dropState" => Ok(Self::Drop),
            "dump" | "dumpState" => Ok(Self::Dump),
            "echo_query" | "echoQuery" => Ok(Self::EchoQuery),
            other => Err(format!("unknown method `{other}`")),
        }
    }
}

#[derive(Debug)]
pub struct StateBlock {
    info: BlockInfo,
    method: Method,
}

impl StateBlock {
    fn pair<'a>(&self, args: &'a ArgList) -> Result<(&'a str, &'a str), BlockError> {
        match (args.get(0), args.get(1)) {
            (Some(name), Some(value)) if !name.is_empty() => Ok((name, value)),
            _ => Err(BlockError::recoverable(
                &self.info,
                "a non-empty variable name and a value are required",
            )),
        }
    }
}

#[async_trait]
impl Block for StateBlock {
    fn info(&self) -> &BlockInfo {
        &self.info
    }

    async fn call(&self, ctx: &Arc<Context>, invoke: &mut InvokeContext) -> Result<(), BlockError> {
        let state = ctx.state();
        let doc = match self.method {
            Method::SetString => {
                let (name, value) = self.pair(invoke.args())?;
                state.set(name, StateValue::String(value.to_string()));
                Document::new()
            }
            Method::SetLong => {
                let (name, value) = self.pair(invoke.args())?;
                let parsed = value.trim().parse::<i64>().map_err(|err| {
                    BlockError::recoverable(&self.info, format!("`{value}` is not a long: {err}"))
                })?;
                state.set(name, StateValue::Long(parsed));
                Document::new()
            }
            Method::SetBool => {
                let (name, value) = self.pair(invoke.args())?;
                state.set(name, StateValue::Bool(parse_bool(value)));
                Document::new()
            }
            Method::SetDefault => {
                let (name, value) = self.pair(invoke.args())?;
                state.set_default(name, StateValue::String(value.to_string()));
                Document::new()
            }
            Method::Drop => {
                state.erase_prefix(invoke.args().get(0).unwrap_or_default());
                Document::new()
            }
            Method::Dump => {
                let entries = state.snapshot().into_iter().map(|(name, value)| {
                    let element = Element::new("param")
                        .with_attribute("name", name)
                        .with_attribute("type", value.type_name());
                    (element, value.to_string())
                });
                listing("state", entries)
            }
            Method::EchoQuery => {
                let entries = ctx.request().query_args().iter().map(|(name, value)| {
                    (Element::new("param").with_attribute("name", name), value.clone())
                });
                listing("query", entries)
            }
        };
        invoke.set_document(doc);
        Ok(())
    }

    fn is_tag_capable(&self) -> bool {
        false
    }
}

fn parse_bool(value: &str) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" => false,
        _ => true,
    }
}

fn listing(root: &str, entries: impl IntoIterator<Item = (Element, String)>) -> Document {
    let mut doc = Document::with_root(Element::new(root));
    let Some(root) = doc.root_element() else {
        return doc;
    };
    for (element, text) in entries {
        let param = doc.create_element(element);
        if !text.is_empty() {
            let text = doc.create_text(text);
            doc.append_child(param, text);
        }
        doc.append_child(root, param);
    }
    doc
}

pub struct StateFactory;

impl BlockFactory for StateFactory {
    fn create(
        &self,
        declaration: BlockDeclaration,
        _env: &ParseEnv<'_>,
    ) -> Result<Arc<dyn Block>, ScriptError> {
        let info = declaration.info;
        let method = info
            .method
            .parse::<Method>()
            .map_err(|reason| ScriptError::invalid_block(info.identity(), reason))?;
        if info.params.len() < method.arity() {
            return Err(ScriptError::invalid_block(
                info.identity(),
                format!("expected {} params, found {}", method.arity(), info.params.len()),
            ));
        }
        Ok(Arc::new(StateBlock { info, method }))
    }
}
