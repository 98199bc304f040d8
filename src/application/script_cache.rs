//! Parsed scripts by path. A file is parsed by one caller at a time and
//! re-parsed once its modification time changes.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::Mutex;
use tracing::debug;

use super::script::{ParseEnv, Script, ScriptError};

const SOURCE: &str = "application::script_cache";

struct Loaded {
    modified: Option<SystemTime>,
    script: Arc<Script>,
}

type Slot = Arc<Mutex<Option<Loaded>>>;

#[derive(Default)]
pub struct ScriptCache {
    entries: DashMap<PathBuf, Slot>,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn invalidate(&self, path: &Path) -> bool {
        self.entries.remove(path).is_some()
    }

    pub async fn get_or_load(
        &self,
        path: &Path,
        env: &ParseEnv<'_>,
    ) -> Result<Arc<Script>, ScriptError> {
        let slot: Slot = Arc::clone(self.entries.entry(path.to_path_buf()).or_default().value());
        let mut slot = slot.lock().await;

        let modified = tokio::fs::metadata(path)
            .await
            .map_err(|err| ScriptError::io(path, err))?
            .modified()
            .ok();

        if let Some(loaded) = slot.as_ref() {
            if modified.is_some() && loaded.modified == modified {
                counter!("tessera_script_cache_hit_total").increment(1);
                return Ok(Arc::clone(&loaded.script));
            }
        }

        let script = Arc::new(Script::load(path, env).await?);
        counter!("tessera_script_parse_total").increment(1);
        debug!(
            target = SOURCE,
            path = %path.display(),
            reparsed = slot.is_some(),
            "Parsed script file"
        );
        *slot = Some(Loaded {
            modified,
            script: Arc::clone(&script),
        });
        Ok(script)
    }
}

impl std::fmt::Debug for ScriptCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use crate::application::engine::tests::test_engine;

    use super::*;

    #[tokio::test]
    async fn unchanged_files_are_parsed_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.xml");
        fs::write(&path, "<page/>").expect("write script");

        let engine = test_engine();
        let first = engine.load_script(&path).await.expect("first load");
        let second = engine.load_script(&path).await.expect("second load");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.scripts().len(), 1);
    }

    #[tokio::test]
    async fn changed_files_are_reparsed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.xml");
        fs::write(&path, "<page/>").expect("write script");

        let engine = test_engine();
        let first = engine.load_script(&path).await.expect("first load");

        fs::write(&path, "<page><changed/></page>").expect("rewrite script");
        let later = SystemTime::now() + Duration::from_secs(5);
        fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(later))
            .expect("bump mtime");

        let second = engine.load_script(&path).await.expect("second load");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.document().to_xml().contains("<changed/>"));
    }

    #[tokio::test]
    async fn missing_files_are_io_errors() {
        let engine = test_engine();
        let result = engine.load_script(Path::new("/nonexistent/page.xml")).await;
        assert!(matches!(result, Err(ScriptError::Io { .. })));
    }
}
