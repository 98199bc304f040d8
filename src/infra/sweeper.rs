//! Background removal of expired cache entries.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::application::engine::Engine;

const SOURCE: &str = "infra::sweeper";

/// Sweep both stores every `interval` until the handle is aborted.
pub fn spawn(engine: Arc<Engine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // Skip the first immediate tick
        loop {
            ticker.tick().await;
            let removed = engine.sweep_expired();
            if removed > 0 {
                debug!(target = SOURCE, removed, "Swept expired cache entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use crate::{
        application::engine::tests::test_engine,
        domain::{document::Document, tag::Tag},
    };

    use super::*;

    #[tokio::test]
    async fn expired_entries_are_removed_in_the_background() {
        let engine = test_engine();
        let store = engine.block_cache().expect("block cache enabled");
        let now = OffsetDateTime::now_utc();
        let tag = Tag::fresh(Some(now), Some(now - time::Duration::seconds(1)));
        store.save("stale", tag, Arc::new(Document::new()));
        assert_eq!(store.len(), 1);

        let handle = spawn(Arc::clone(&engine), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();
        let _ = handle.await;

        assert_eq!(store.len(), 0);
    }
}
