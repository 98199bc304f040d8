//! Tagged document store.
//!
//! Entries are kept in an LRU map bounded by entry count and expire either
//! when their tag's `expire_time` passes or when the store-wide TTL since they
//! were stored elapses. At most one caller recomputes a given key at a time:
//! a miss hands out a [`RecomputeGuard`], and concurrent callers receive a
//! [`RecomputeWaiter`] that resolves once the guard is released.

use std::{
    collections::BTreeSet,
    fmt,
    num::NonZeroUsize,
    ops::Bound,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry as ClaimEntry};
use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::debug;

use crate::domain::{
    document::Document,
    tag::{Tag, saturating_after},
};

use super::{config::CacheConfig, lock::mutex_lock};

const SOURCE: &str = "cache::store";

/// A document together with the tag it was stored under.
#[derive(Debug, Clone)]
pub struct Cached {
    pub tag: Tag,
    pub doc: Arc<Document>,
}

#[derive(Debug)]
pub enum LoadOutcome {
    /// Fresh hit.
    Found { tag: Tag, doc: Arc<Document> },
    /// Nothing stored; the caller owns the recomputation for this key.
    NotFound(RecomputeGuard),
    /// The stored copy is past its freshness window. It stays resident so an
    /// unmodified save can refresh it in place.
    Expired {
        tag: Tag,
        doc: Arc<Document>,
        guard: RecomputeGuard,
    },
    /// Another caller is recomputing the key.
    NeedRecompute {
        stale: Option<Cached>,
        waiter: RecomputeWaiter,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Stored,
    Updated,
}

#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    name: &'static str,
    capacity: NonZeroUsize,
    ttl: Option<Duration>,
    entries: Mutex<Entries>,
    claims: DashMap<String, Claim>,
    next_claim: AtomicU64,
}

/// The LRU map plus an index of entries by wall-clock deadline, so expired
/// entries can be found without scanning the map.
struct Entries {
    lru: LruCache<String, Entry>,
    by_deadline: BTreeSet<(OffsetDateTime, String)>,
}

struct Entry {
    tag: Tag,
    doc: Arc<Document>,
    stored_at: Instant,
    deadline: Option<OffsetDateTime>,
}

impl Entries {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            lru: LruCache::new(capacity),
            by_deadline: BTreeSet::new(),
        }
    }

    fn insert(&mut self, key: &str, entry: Entry) -> Option<(String, Entry)> {
        let deadline = entry.deadline;
        let evicted = self.lru.push(key.to_string(), entry);
        if let Some((evicted_key, evicted_entry)) = &evicted {
            self.unindex(evicted_entry.deadline, evicted_key);
        }
        self.index(deadline, key);
        evicted
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.lru.pop(key)?;
        self.unindex(entry.deadline, key);
        Some(entry)
    }

    fn clear(&mut self) {
        self.lru.clear();
        self.by_deadline.clear();
    }

    fn index(&mut self, deadline: Option<OffsetDateTime>, key: &str) {
        if let Some(at) = deadline {
            self.by_deadline.insert((at, key.to_string()));
        }
    }

    fn unindex(&mut self, deadline: Option<OffsetDateTime>, key: &str) {
        if let Some(at) = deadline {
            self.by_deadline.remove(&(at, key.to_string()));
        }
    }

    /// First indexed deadline after `cursor`, or the earliest one.
    fn next_deadline(
        &self,
        cursor: Option<&(OffsetDateTime, String)>,
    ) -> Option<(OffsetDateTime, String)> {
        match cursor {
            Some(after) => self
                .by_deadline
                .range::<(OffsetDateTime, String), _>((Bound::Excluded(after), Bound::Unbounded))
                .next()
                .cloned(),
            None => self.by_deadline.first().cloned(),
        }
    }
}

struct Claim {
    id: u64,
    done: watch::Sender<bool>,
}

impl CacheStore {
    pub fn new(name: &'static str, capacity: NonZeroUsize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name,
                capacity,
                ttl,
                entries: Mutex::new(Entries::new(capacity)),
                claims: DashMap::new(),
                next_claim: AtomicU64::new(1),
            }),
        }
    }

    /// Store for tagged block results.
    pub fn blocks(config: &CacheConfig) -> Self {
        Self::new("block", config.block_capacity_non_zero(), config.ttl())
    }

    /// Store for assembled pages.
    pub fn pages(config: &CacheConfig) -> Self {
        Self::new("page", config.page_capacity_non_zero(), config.ttl())
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity.get()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.entries, SOURCE, "len").lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is resident, fresh or not. Does not touch LRU order.
    pub fn contains(&self, key: &str) -> bool {
        mutex_lock(&self.inner.entries, SOURCE, "contains")
            .lru
            .contains(key)
    }

    pub fn clear(&self) {
        mutex_lock(&self.inner.entries, SOURCE, "clear").clear();
    }

    pub fn load(&self, key: &str) -> LoadOutcome {
        let store = self.inner.name;
        let now = OffsetDateTime::now_utc();

        let resident = match self.inner.lookup(key, now, "load") {
            Some((cached, false)) => {
                counter!("tessera_cache_hit_total", "store" => store).increment(1);
                return LoadOutcome::Found {
                    tag: cached.tag,
                    doc: cached.doc,
                };
            }
            Some((cached, true)) => {
                counter!("tessera_cache_expired_total", "store" => store).increment(1);
                Some(cached)
            }
            None => {
                counter!("tessera_cache_miss_total", "store" => store).increment(1);
                None
            }
        };

        match self.claim(key) {
            // A producer may have saved and released the key between the
            // lookup and the claim, so look again while holding the claim.
            Ok(guard) => match self.inner.lookup(key, now, "load.claimed") {
                Some((cached, false)) => {
                    drop(guard);
                    LoadOutcome::Found {
                        tag: cached.tag,
                        doc: cached.doc,
                    }
                }
                Some((cached, true)) => LoadOutcome::Expired {
                    tag: cached.tag,
                    doc: cached.doc,
                    guard,
                },
                None => LoadOutcome::NotFound(guard),
            },
            Err(waiter) => {
                counter!("tessera_cache_contention_total", "store" => store).increment(1);
                debug!(
                    target = SOURCE,
                    store,
                    key,
                    "Recomputation already in flight"
                );
                LoadOutcome::NeedRecompute {
                    stale: resident,
                    waiter,
                }
            }
        }
    }

    /// Store `doc` under `key`. An unmodified tag with a resident entry only
    /// refreshes that entry's freshness window and keeps its document.
    pub fn save(&self, key: &str, tag: Tag, doc: Arc<Document>) -> SaveOutcome {
        self.inner.save(key, tag, doc)
    }

    /// Drop expired entries that nobody is recomputing. Returns the number removed.
    ///
    /// Walks the deadline index one entry per lock acquisition, so lookups of
    /// other keys wait for at most a single removal.
    pub fn sweep_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut cursor: Option<(OffsetDateTime, String)> = None;
        let mut removed = 0usize;

        loop {
            let mut entries = mutex_lock(&self.inner.entries, SOURCE, "sweep");
            let Some((deadline, key)) = entries.next_deadline(cursor.as_ref()) else {
                break;
            };
            if deadline > now {
                break;
            }
            let expired = entries
                .lru
                .peek(&key)
                .is_some_and(|entry| self.inner.is_expired(entry, now));
            if expired && !self.inner.claims.contains_key(&key) {
                entries.remove(&key);
                removed += 1;
            }
            drop(entries);
            cursor = Some((deadline, key));
        }

        if removed > 0 {
            counter!("tessera_cache_sweep_removed_total", "store" => self.inner.name)
                .increment(removed as u64);
        }
        removed
    }

    fn claim(&self, key: &str) -> Result<RecomputeGuard, RecomputeWaiter> {
        match self.inner.claims.entry(key.to_string()) {
            ClaimEntry::Vacant(vacant) => {
                let id = self.inner.next_claim.fetch_add(1, Ordering::Relaxed);
                let (done, _) = watch::channel(false);
                vacant.insert(Claim { id, done });
                Ok(RecomputeGuard {
                    key: key.to_string(),
                    id,
                    store: Arc::clone(&self.inner),
                })
            }
            ClaimEntry::Occupied(occupied) => Err(RecomputeWaiter {
                done: occupied.get().done.subscribe(),
            }),
        }
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}

impl StoreInner {
    fn is_expired(&self, entry: &Entry, now: OffsetDateTime) -> bool {
        entry.tag.expired_at(now)
            || self
                .ttl
                .is_some_and(|ttl| entry.stored_at.elapsed() >= ttl)
    }

    /// Peek `key` and promote it when it is still fresh.
    fn lookup(&self, key: &str, now: OffsetDateTime, op: &'static str) -> Option<(Cached, bool)> {
        let mut entries = mutex_lock(&self.entries, SOURCE, op);
        let (cached, expired) = entries.lru.peek(key).map(|entry| {
            let cached = Cached {
                tag: entry.tag,
                doc: Arc::clone(&entry.doc),
            };
            (cached, self.is_expired(entry, now))
        })?;
        if !expired {
            entries.lru.promote(key);
        }
        Some((cached, expired))
    }

    /// Wall-clock instant after which an entry stored now is expired.
    fn deadline(&self, tag: &Tag, now: OffsetDateTime) -> Option<OffsetDateTime> {
        let by_ttl = self.ttl.map(|ttl| saturating_after(now, ttl));
        match (tag.expire_time, by_ttl) {
            (Some(at), Some(ttl)) => Some(at.min(ttl)),
            (at, ttl) => at.or(ttl),
        }
    }

    fn save(&self, key: &str, tag: Tag, doc: Arc<Document>) -> SaveOutcome {
        let store = self.name;
        let now = OffsetDateTime::now_utc();
        let mut entries = mutex_lock(&self.entries, SOURCE, "save");

        if !tag.modified {
            if let Some(previous) = entries.remove(key) {
                let tag = Tag {
                    modified: false,
                    last_modified: tag.last_modified.or(previous.tag.last_modified),
                    expire_time: tag.expire_time,
                };
                let deadline = self.deadline(&tag, now);
                entries.insert(
                    key,
                    Entry {
                        tag,
                        doc: previous.doc,
                        stored_at: Instant::now(),
                        deadline,
                    },
                );
                drop(entries);
                counter!("tessera_cache_update_total", "store" => store).increment(1);
                return SaveOutcome::Updated;
            }
        }

        let deadline = self.deadline(&tag, now);
        let evicted = entries.insert(
            key,
            Entry {
                tag,
                doc,
                stored_at: Instant::now(),
                deadline,
            },
        );
        drop(entries);

        match evicted {
            Some((previous, _)) if previous == key => {
                counter!("tessera_cache_update_total", "store" => store).increment(1);
                SaveOutcome::Updated
            }
            Some((victim, _)) => {
                counter!("tessera_cache_evict_total", "store" => store).increment(1);
                counter!("tessera_cache_store_total", "store" => store).increment(1);
                debug!(target = SOURCE, store, victim = %victim, "Evicted least recently used entry");
                SaveOutcome::Stored
            }
            None => {
                counter!("tessera_cache_store_total", "store" => store).increment(1);
                SaveOutcome::Stored
            }
        }
    }

    fn release(&self, key: &str, id: u64) {
        if let Some((_, claim)) = self.claims.remove_if(key, |_, claim| claim.id == id) {
            claim.done.send_replace(true);
        }
    }
}

/// Exclusive right to recompute one key. Released on drop.
pub struct RecomputeGuard {
    key: String,
    id: u64,
    store: Arc<StoreInner>,
}

impl RecomputeGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Store the recomputed document and release the claim.
    pub fn save(self, tag: Tag, doc: Arc<Document>) -> SaveOutcome {
        self.store.save(&self.key, tag, doc)
    }
}

impl Drop for RecomputeGuard {
    fn drop(&mut self) {
        self.store.release(&self.key, self.id);
    }
}

impl fmt::Debug for RecomputeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecomputeGuard")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Resolves when the in-flight recomputation of a key finishes.
#[derive(Debug)]
pub struct RecomputeWaiter {
    done: watch::Receiver<bool>,
}

impl RecomputeWaiter {
    pub async fn wait(mut self) {
        // A closed channel also means the claim is gone.
        let _ = self.done.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use crate::domain::document::Element;

    use super::*;

    fn store(capacity: usize) -> CacheStore {
        CacheStore::new(
            "test",
            NonZeroUsize::new(capacity).expect("non-zero"),
            None,
        )
    }

    fn doc(name: &str) -> Arc<Document> {
        Arc::new(Document::with_root(Element::new(name)))
    }

    fn fresh_tag() -> Tag {
        Tag::fresh(
            Some(OffsetDateTime::now_utc()),
            Some(OffsetDateTime::now_utc() + time::Duration::hours(1)),
        )
    }

    #[test]
    fn miss_then_save_then_hit() {
        let store = store(4);
        let payload = doc("a");

        let LoadOutcome::NotFound(guard) = store.load("k") else {
            panic!("expected a miss");
        };
        assert_eq!(guard.save(fresh_tag(), Arc::clone(&payload)), SaveOutcome::Stored);

        match store.load("k") {
            LoadOutcome::Found { doc, .. } => assert!(Arc::ptr_eq(&doc, &payload)),
            other => panic!("expected a hit, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_miss_waits_for_the_claim() {
        let store = store(4);
        let LoadOutcome::NotFound(guard) = store.load("k") else {
            panic!("expected a miss");
        };

        assert!(matches!(
            store.load("k"),
            LoadOutcome::NeedRecompute { stale: None, .. }
        ));

        drop(guard);
        assert!(matches!(store.load("k"), LoadOutcome::NotFound(_)));
    }

    #[test]
    fn unmodified_save_keeps_document_identity() {
        let store = store(4);
        let original = doc("a");
        store.save("k", fresh_tag(), Arc::clone(&original));

        let refreshed = fresh_tag().unmodified();
        assert_eq!(store.save("k", refreshed, doc("b")), SaveOutcome::Updated);

        match store.load("k") {
            LoadOutcome::Found { doc, tag } => {
                assert!(Arc::ptr_eq(&doc, &original));
                assert_eq!(tag.expire_time, refreshed.expire_time);
            }
            other => panic!("expected a hit, got {other:?}"),
        }
    }

    #[test]
    fn modified_save_replaces_document() {
        let store = store(4);
        store.save("k", fresh_tag(), doc("a"));
        let replacement = doc("b");

        assert_eq!(
            store.save("k", fresh_tag(), Arc::clone(&replacement)),
            SaveOutcome::Updated
        );
        match store.load("k") {
            LoadOutcome::Found { doc, .. } => assert!(Arc::ptr_eq(&doc, &replacement)),
            other => panic!("expected a hit, got {other:?}"),
        }
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let store = store(2);
        store.save("a", fresh_tag(), doc("a"));
        store.save("b", fresh_tag(), doc("b"));
        assert!(matches!(store.load("a"), LoadOutcome::Found { .. }));

        store.save("c", fresh_tag(), doc("c"));

        assert_eq!(store.len(), 2);
        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
    }

    #[test]
    fn expired_tag_is_refreshed_in_place() {
        let store = store(4);
        let original = doc("a");
        let past = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        store.save("k", Tag::fresh(None, Some(past)), Arc::clone(&original));

        let LoadOutcome::Expired { doc: stale, guard, .. } = store.load("k") else {
            panic!("expected an expired entry");
        };
        assert!(Arc::ptr_eq(&stale, &original));

        let outcome = guard.save(fresh_tag().unmodified(), Arc::new(Document::new()));
        assert_eq!(outcome, SaveOutcome::Updated);
        match store.load("k") {
            LoadOutcome::Found { doc, .. } => assert!(Arc::ptr_eq(&doc, &original)),
            other => panic!("expected a hit, got {other:?}"),
        }
    }

    #[test]
    fn store_ttl_expires_entries() {
        let store = CacheStore::new(
            "test",
            NonZeroUsize::new(4).expect("non-zero"),
            Some(Duration::from_millis(10)),
        );
        store.save("k", Tag::fresh(None, None), doc("a"));
        std::thread::sleep(Duration::from_millis(20));

        assert!(matches!(store.load("k"), LoadOutcome::Expired { .. }));
    }

    #[test]
    fn sweep_skips_entries_being_recomputed() {
        let store = store(4);
        let past = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        store.save("a", Tag::fresh(None, Some(past)), doc("a"));
        store.save("b", Tag::fresh(None, Some(past)), doc("b"));
        store.save("c", fresh_tag(), doc("c"));

        let LoadOutcome::Expired { guard, .. } = store.load("a") else {
            panic!("expected an expired entry");
        };

        assert_eq!(store.sweep_expired(), 1);
        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
        drop(guard);

        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sweep_follows_deadlines_and_refreshes() {
        let store = store(64);
        let past = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        for index in 0..40 {
            let tag = if index % 2 == 0 {
                Tag::fresh(None, Some(past))
            } else {
                fresh_tag()
            };
            store.save(&format!("k{index}"), tag, doc("a"));
        }
        store.save("open", Tag::fresh(None, None), doc("a"));
        assert_eq!(store.save("k0", fresh_tag().unmodified(), doc("b")), SaveOutcome::Updated);

        assert_eq!(store.sweep_expired(), 19);
        assert_eq!(store.len(), 22);
        assert!(store.contains("k0"));
        assert!(store.contains("open"));
        assert!(!store.contains("k2"));
        assert_eq!(store.sweep_expired(), 0);
    }

    #[test]
    fn threaded_cycles_never_produce_twice() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 200;

        let store = store(ROUNDS);
        let barrier = Arc::new(std::sync::Barrier::new(THREADS));
        let produced: Arc<Vec<AtomicUsize>> =
            Arc::new((0..ROUNDS).map(|_| AtomicUsize::new(0)).collect());

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let store = store.clone();
                let barrier = Arc::clone(&barrier);
                let produced = Arc::clone(&produced);
                std::thread::spawn(move || {
                    for round in 0..ROUNDS {
                        let key = format!("round-{round}");
                        barrier.wait();
                        loop {
                            match store.load(&key) {
                                LoadOutcome::Found { .. } => break,
                                LoadOutcome::NotFound(guard)
                                | LoadOutcome::Expired { guard, .. } => {
                                    produced[round].fetch_add(1, Ordering::SeqCst);
                                    guard.save(fresh_tag(), doc("shared"));
                                    break;
                                }
                                LoadOutcome::NeedRecompute { .. } => std::thread::yield_now(),
                            }
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker should finish");
        }
        for (round, count) in produced.iter().enumerate() {
            assert_eq!(count.load(Ordering::SeqCst), 1, "round {round}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cycles_produce_once() {
        let store = store(4);
        let produced = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let produced = Arc::clone(&produced);
            tasks.push(tokio::spawn(async move {
                loop {
                    match store.load("shared") {
                        LoadOutcome::Found { doc, .. } => return doc,
                        LoadOutcome::NotFound(guard) | LoadOutcome::Expired { guard, .. } => {
                            produced.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            let doc = Arc::new(Document::with_root(Element::new("shared")));
                            guard.save(fresh_tag(), Arc::clone(&doc));
                            return doc;
                        }
                        LoadOutcome::NeedRecompute { waiter, .. } => waiter.wait().await,
                    }
                }
            }));
        }

        for task in tasks {
            task.await.expect("task should finish");
        }
        assert_eq!(produced.load(Ordering::SeqCst), 1);
    }
}
