//! Per-block invocation state: the produced document, its freshness tag and
//! how the result should influence page cacheability.

use std::{fmt, sync::Arc, time::Duration};

use crate::{
    cache::Cached,
    domain::{
        document::{Document, Element},
        tag::{Tag, TagKey},
    },
};

use super::context::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultType {
    Success,
    #[default]
    Error,
    NoCache,
}

/// How the slot came to be filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Executed,
    Cached,
    Skipped,
    NotExecuted,
    TimedOut,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Cached => "cached",
            Self::Skipped => "skipped",
            Self::NotExecuted => "not_executed",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        }
    }
}

/// Evaluated block parameters, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgList(Vec<String>);

impl ArgList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: impl Into<String>) {
        self.0.push(value.into());
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<String> for ArgList {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Clone)]
pub struct InvokeContext {
    doc: Arc<Document>,
    meta: Option<Arc<Document>>,
    tag: Option<Tag>,
    previous: Option<Cached>,
    have_cached_copy: bool,
    result_type: ResultType,
    outcome: Outcome,
    args: ArgList,
    tag_key: Option<TagKey>,
    local_context: Option<Arc<Context>>,
    elapsed: Duration,
}

impl InvokeContext {
    /// Fresh invocation state. The result stays an error until the block
    /// completes successfully.
    pub fn new(args: ArgList) -> Self {
        Self {
            doc: Arc::new(Document::new()),
            meta: None,
            tag: None,
            previous: None,
            have_cached_copy: false,
            result_type: ResultType::Error,
            outcome: Outcome::Executed,
            args,
            tag_key: None,
            local_context: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Empty result for a block that was never started.
    pub fn skipped() -> Self {
        Self::empty_success(Outcome::Skipped)
    }

    /// Empty result for a block suppressed by its guard.
    pub fn not_executed() -> Self {
        Self::empty_success(Outcome::NotExecuted)
    }

    /// Error result carrying the block-specific error document.
    pub fn failed(doc: Document, outcome: Outcome) -> Self {
        Self {
            doc: Arc::new(doc),
            outcome,
            ..Self::new(ArgList::new())
        }
    }

    /// Generic placeholder used when no block can describe the failure.
    pub fn timed_out_placeholder() -> Self {
        let element = Element::new("xscript_invoke_failed").with_attribute("error", "timed out");
        Self::failed(Document::with_root(element), Outcome::TimedOut)
    }

    fn empty_success(outcome: Outcome) -> Self {
        Self {
            result_type: ResultType::Success,
            outcome,
            ..Self::new(ArgList::new())
        }
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn doc_arc(&self) -> Arc<Document> {
        Arc::clone(&self.doc)
    }

    pub fn set_document(&mut self, doc: Document) {
        self.doc = Arc::new(doc);
    }

    pub fn set_document_arc(&mut self, doc: Arc<Document>) {
        self.doc = doc;
    }

    pub fn meta(&self) -> Option<&Document> {
        self.meta.as_deref()
    }

    pub fn set_meta(&mut self, meta: Document) {
        self.meta = Some(Arc::new(meta));
    }

    pub fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }

    pub fn tagged(&self) -> bool {
        self.tag.is_some()
    }

    pub fn set_tag(&mut self, tag: Tag) {
        self.tag = Some(tag);
    }

    /// The stale stored copy, available to producers as a freshness probe.
    pub fn previous(&self) -> Option<&Cached> {
        self.previous.as_ref()
    }

    pub(crate) fn set_previous(&mut self, previous: Cached) {
        self.previous = Some(previous);
    }

    pub(crate) fn take_previous(&mut self) -> Option<Cached> {
        self.previous.take()
    }

    pub fn have_cached_copy(&self) -> bool {
        self.have_cached_copy
    }

    /// Serve the result straight from the store.
    pub(crate) fn use_cached(&mut self, tag: Tag, doc: Arc<Document>) {
        self.doc = doc;
        self.tag = Some(tag.unmodified());
        self.have_cached_copy = true;
        self.result_type = ResultType::Success;
        self.outcome = Outcome::Cached;
    }

    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    /// Successful content, cacheable or not.
    pub fn is_success(&self) -> bool {
        self.result_type != ResultType::Error
    }

    pub fn is_no_cache(&self) -> bool {
        self.result_type == ResultType::NoCache
    }

    /// Mark the result as valid content that must not be cached.
    pub fn set_no_cache(&mut self) {
        self.result_type = ResultType::NoCache;
    }

    pub(crate) fn mark_success(&mut self) {
        if self.result_type == ResultType::Error {
            self.result_type = ResultType::Success;
        }
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn args(&self) -> &ArgList {
        &self.args
    }

    pub fn tag_key(&self) -> Option<&TagKey> {
        self.tag_key.as_ref()
    }

    pub(crate) fn set_tag_key(&mut self, key: TagKey) {
        self.tag_key = Some(key);
    }

    pub fn local_context(&self) -> Option<&Arc<Context>> {
        self.local_context.as_ref()
    }

    pub fn set_local_context(&mut self, ctx: Arc<Context>) {
        self.local_context = Some(ctx);
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub(crate) fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
    }
}

impl fmt::Debug for InvokeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeContext")
            .field("result_type", &self.result_type)
            .field("outcome", &self.outcome)
            .field("tag", &self.tag)
            .field("have_cached_copy", &self.have_cached_copy)
            .field("args", &self.args)
            .field("tag_key", &self.tag_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_invocation_starts_as_error() {
        let invoke = InvokeContext::new(ArgList::new());
        assert_eq!(invoke.result_type(), ResultType::Error);
        assert!(!invoke.is_success());
    }

    #[test]
    fn mark_success_keeps_no_cache() {
        let mut invoke = InvokeContext::new(ArgList::new());
        invoke.set_no_cache();
        invoke.mark_success();
        assert!(invoke.is_no_cache());
        assert!(invoke.is_success());
    }

    #[test]
    fn skipped_results_are_empty_successes() {
        let skipped = InvokeContext::skipped();
        assert!(skipped.is_success());
        assert_eq!(skipped.outcome(), Outcome::Skipped);
        assert!(skipped.doc().root_element().is_none());
    }
}
