//! Execution context: owns the result slots of one script invocation and the
//! single timeout-bounded join over them.
//!
//! Slots move from pending to filled exactly once. The context itself moves
//! `Created -> Expecting -> Waiting -> Stopped`; once stopped, late results
//! are discarded so a timeout placeholder is never overwritten.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::lock::mutex_lock;

use super::{
    block::BlockError,
    engine::Engine,
    invoke::InvokeContext,
    request::{Request, Response, State},
    script::Script,
};

const SOURCE: &str = "application::context";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("context already started")]
    AlreadyStarted,
    #[error("context already stopped")]
    AlreadyStopped,
    #[error("context is not expecting results")]
    NotExpecting,
    #[error("result slot {index} is out of range ({len} slots)")]
    SlotOutOfRange { index: usize, len: usize },
    #[error("result slot {index} already filled")]
    SlotFilled { index: usize },
    #[error("context parameter `{name}` already set")]
    DuplicateParam { name: String },
    #[error("context parameter `{name}` not found")]
    MissingParam { name: String },
    #[error("context parameter `{name}` has a different type")]
    ParamType { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Expecting,
    Waiting,
    Stopped,
}

struct Slots {
    phase: Phase,
    results: Vec<Option<InvokeContext>>,
}

/// Deadline measured from the moment the timer was started.
#[derive(Debug)]
pub struct TimeoutCounter {
    window: Mutex<(Instant, Duration)>,
}

impl TimeoutCounter {
    pub fn new(limit: Duration) -> Self {
        Self {
            window: Mutex::new((Instant::now(), limit)),
        }
    }

    pub fn start(&self, limit: Duration) {
        *mutex_lock(&self.window, SOURCE, "timer.start") = (Instant::now(), limit);
    }

    pub fn remained(&self) -> Duration {
        let (started, limit) = *mutex_lock(&self.window, SOURCE, "timer.remained");
        limit.saturating_sub(started.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remained().is_zero()
    }
}

type ParamMap = HashMap<String, Arc<dyn Any + Send + Sync>>;

pub struct Context {
    id: Uuid,
    engine: Arc<Engine>,
    script: Arc<Script>,
    parent: Option<Arc<Context>>,
    request: Arc<Request>,
    response: Arc<Response>,
    state: Arc<State>,
    local_params: BTreeMap<String, String>,
    slots: Mutex<Slots>,
    pending: watch::Sender<usize>,
    stopped: AtomicBool,
    no_cache: AtomicBool,
    skip_remaining: AtomicBool,
    stop_blocks: AtomicBool,
    force_no_threaded: AtomicBool,
    params: Mutex<ParamMap>,
    timer: TimeoutCounter,
    critical: Mutex<Option<BlockError>>,
}

impl Context {
    /// Root context for one request.
    pub fn new(engine: Arc<Engine>, script: Arc<Script>, request: Request) -> Arc<Self> {
        let timer = TimeoutCounter::new(engine.config().request_timeout);
        let force_no_threaded = engine.config().force_no_threaded;
        Arc::new(Self::build(
            engine,
            script,
            None,
            Arc::new(request),
            Arc::new(Response::new()),
            Arc::new(State::new()),
            BTreeMap::new(),
            timer,
            force_no_threaded,
        ))
    }

    /// Nested context sharing the request, response and state of `parent`.
    pub fn child(
        parent: &Arc<Context>,
        script: Arc<Script>,
        local_params: BTreeMap<String, String>,
    ) -> Arc<Self> {
        let timer = TimeoutCounter::new(parent.root().timer.remained());
        Arc::new(Self::build(
            Arc::clone(&parent.engine),
            script,
            Some(Arc::clone(parent)),
            Arc::clone(&parent.request),
            Arc::clone(&parent.response),
            Arc::clone(&parent.state),
            local_params,
            timer,
            parent.force_no_threaded(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        engine: Arc<Engine>,
        script: Arc<Script>,
        parent: Option<Arc<Context>>,
        request: Arc<Request>,
        response: Arc<Response>,
        state: Arc<State>,
        local_params: BTreeMap<String, String>,
        timer: TimeoutCounter,
        force_no_threaded: bool,
    ) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            id: Uuid::new_v4(),
            engine,
            script,
            parent,
            request,
            response,
            state,
            local_params,
            slots: Mutex::new(Slots {
                phase: Phase::Created,
                results: Vec::new(),
            }),
            pending,
            stopped: AtomicBool::new(false),
            no_cache: AtomicBool::new(false),
            skip_remaining: AtomicBool::new(false),
            stop_blocks: AtomicBool::new(false),
            force_no_threaded: AtomicBool::new(force_no_threaded),
            params: Mutex::new(HashMap::new()),
            timer,
            critical: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn script(&self) -> &Arc<Script> {
        &self.script
    }

    pub fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    pub fn root(&self) -> &Context {
        let mut current = self;
        while let Some(parent) = current.parent.as_deref() {
            current = parent;
        }
        current
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn local_param(&self, name: &str) -> Option<&str> {
        self.local_params.get(name).map(String::as_str)
    }

    pub fn local_params(&self) -> &BTreeMap<String, String> {
        &self.local_params
    }

    pub fn timer(&self) -> &TimeoutCounter {
        &self.timer
    }

    pub fn phase(&self) -> Phase {
        mutex_lock(&self.slots, SOURCE, "phase").phase
    }

    /// Declare the number of result slots. Legal once, before anything else.
    pub fn expect(&self, count: usize) -> Result<(), ContextError> {
        let mut slots = mutex_lock(&self.slots, SOURCE, "expect");
        match slots.phase {
            Phase::Created => {}
            Phase::Stopped => return Err(ContextError::AlreadyStopped),
            Phase::Expecting | Phase::Waiting => return Err(ContextError::AlreadyStarted),
        }
        slots.phase = Phase::Expecting;
        slots.results = (0..count).map(|_| None).collect();
        self.pending.send_replace(count);
        Ok(())
    }

    /// Fill slot `index`. After the context stopped the result is dropped.
    pub fn set_result(&self, index: usize, result: InvokeContext) -> Result<(), ContextError> {
        let mut slots = mutex_lock(&self.slots, SOURCE, "set_result");
        match slots.phase {
            Phase::Stopped => {
                debug!(
                    target = SOURCE,
                    request_id = %self.id,
                    index,
                    outcome = result.outcome().as_str(),
                    "Discarding late result after context stop"
                );
                return Ok(());
            }
            Phase::Created => return Err(ContextError::NotExpecting),
            Phase::Expecting | Phase::Waiting => {}
        }

        let len = slots.results.len();
        let slot = slots
            .results
            .get_mut(index)
            .ok_or(ContextError::SlotOutOfRange { index, len })?;
        if slot.is_some() {
            return Err(ContextError::SlotFilled { index });
        }
        *slot = Some(result);

        let remaining = slots.results.iter().filter(|slot| slot.is_none()).count();
        self.pending.send_replace(remaining);
        Ok(())
    }

    pub fn result(&self, index: usize) -> Option<InvokeContext> {
        mutex_lock(&self.slots, SOURCE, "result")
            .results
            .get(index)
            .and_then(Clone::clone)
    }

    pub fn results_ready(&self) -> bool {
        mutex_lock(&self.slots, SOURCE, "results_ready")
            .results
            .iter()
            .all(Option::is_some)
    }

    /// Wait for every slot or until `timeout` elapses. Pending slots are then
    /// filled with timeout errors and the context stops.
    pub async fn wait(&self, timeout: Duration) -> Result<(), ContextError> {
        {
            let mut slots = mutex_lock(&self.slots, SOURCE, "wait.begin");
            match slots.phase {
                Phase::Created => return Err(ContextError::NotExpecting),
                Phase::Stopped => return Ok(()),
                Phase::Expecting | Phase::Waiting => slots.phase = Phase::Waiting,
            }
        }

        let mut pending = self.pending.subscribe();
        let timed_out = tokio::time::timeout(timeout, pending.wait_for(|left| *left == 0))
            .await
            .is_err();

        let mut slots = mutex_lock(&self.slots, SOURCE, "wait.finish");
        if timed_out {
            let mut filled = 0usize;
            for (index, slot) in slots.results.iter_mut().enumerate() {
                if slot.is_none() {
                    let placeholder = self
                        .script
                        .blocks()
                        .get(index)
                        .map(|block| block.error_result("timed out"))
                        .unwrap_or_else(InvokeContext::timed_out_placeholder);
                    *slot = Some(placeholder);
                    filled += 1;
                }
            }
            if filled > 0 {
                warn!(
                    target = SOURCE,
                    request_id = %self.id,
                    script = self.script.name(),
                    timed_out = filled,
                    timeout_ms = timeout.as_millis() as u64,
                    "Blocks did not finish before the deadline"
                );
                self.set_no_cache();
            }
        }
        slots.phase = Phase::Stopped;
        self.stopped.store(true, Ordering::SeqCst);
        self.pending.send_replace(0);
        Ok(())
    }

    /// Finalise the context. Idempotent.
    pub fn stop(&self) {
        let mut slots = mutex_lock(&self.slots, SOURCE, "stop");
        if slots.phase != Phase::Stopped {
            slots.phase = Phase::Stopped;
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn no_cache(&self) -> bool {
        self.no_cache.load(Ordering::SeqCst)
    }

    /// Mark this context and every ancestor as not cacheable.
    pub fn set_no_cache(&self) {
        let mut current = Some(self);
        while let Some(ctx) = current {
            ctx.no_cache.store(true, Ordering::SeqCst);
            current = ctx.parent.as_deref();
        }
    }

    pub fn skip_remaining(&self) -> bool {
        self.skip_remaining.load(Ordering::SeqCst)
    }

    pub fn set_skip_remaining(&self) {
        self.skip_remaining.store(true, Ordering::SeqCst);
    }

    pub fn stop_blocks(&self) -> bool {
        self.stop_blocks.load(Ordering::SeqCst)
    }

    pub fn set_stop_blocks(&self) {
        self.stop_blocks.store(true, Ordering::SeqCst);
    }

    pub fn force_no_threaded(&self) -> bool {
        self.force_no_threaded.load(Ordering::SeqCst)
    }

    pub fn set_force_no_threaded(&self, value: bool) {
        self.force_no_threaded.store(value, Ordering::SeqCst);
    }

    /// Whether dispatch of further blocks must stop.
    pub fn halted(&self) -> bool {
        self.is_stopped() || self.stop_blocks() || self.skip_remaining()
    }

    pub fn set_param<T: Any + Send + Sync>(
        &self,
        name: impl Into<String>,
        value: T,
    ) -> Result<(), ContextError> {
        let name = name.into();
        let mut params = mutex_lock(&self.params, SOURCE, "set_param");
        if params.contains_key(&name) {
            return Err(ContextError::DuplicateParam { name });
        }
        params.insert(name, Arc::new(value));
        Ok(())
    }

    pub fn param<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ContextError> {
        let value = mutex_lock(&self.params, SOURCE, "param")
            .get(name)
            .cloned()
            .ok_or_else(|| ContextError::MissingParam {
                name: name.to_string(),
            })?;
        value.downcast::<T>().map_err(|_| ContextError::ParamType {
            name: name.to_string(),
        })
    }

    pub fn param_or_insert_with<T, F>(&self, name: &str, create: F) -> Result<Arc<T>, ContextError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let value = Arc::clone(
            mutex_lock(&self.params, SOURCE, "param_or_insert_with")
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(create())),
        );
        value.downcast::<T>().map_err(|_| ContextError::ParamType {
            name: name.to_string(),
        })
    }

    /// Keep the first critical failure raised by any block of this context.
    pub fn record_critical(&self, error: BlockError) {
        let mut critical = mutex_lock(&self.critical, SOURCE, "record_critical");
        if critical.is_none() {
            *critical = Some(error);
        }
        drop(critical);
        self.set_stop_blocks();
    }

    pub fn has_critical(&self) -> bool {
        mutex_lock(&self.critical, SOURCE, "has_critical").is_some()
    }

    pub fn take_critical(&self) -> Option<BlockError> {
        mutex_lock(&self.critical, SOURCE, "take_critical").take()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("script", &self.script.name())
            .field("nested", &self.parent.is_some())
            .field("stopped", &self.is_stopped())
            .field("no_cache", &self.no_cache())
            .finish_non_exhaustive()
    }
}

/// Stops the wrapped context when dropped, on every exit path.
pub struct ContextStopper {
    ctx: Arc<Context>,
}

impl ContextStopper {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

impl Drop for ContextStopper {
    fn drop(&mut self) {
        self.ctx.stop();
    }
}
