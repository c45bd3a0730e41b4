//! Periodic refresh of external list files. Lists are re-parsed when
//! their modification time changes and swapped into the running plugins
//! atomically; a file that fails to parse leaves the previous contents
//! in place.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::Context as _;

type ApplyFn = Box<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

pub struct ReloadableList {
    path: PathBuf,
    apply: ApplyFn,
    last_modified: Option<SystemTime>,
}

impl ReloadableList {
    pub fn new(path: PathBuf, apply: ApplyFn) -> Self {
        ReloadableList {
            path,
            apply,
            last_modified: None,
        }
    }

    /// Loads the file unconditionally. Used once at startup so a broken
    /// file fails the launch instead of being silently skipped.
    pub async fn load(&mut self) -> anyhow::Result<()> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        (self.apply)(&contents).with_context(|| format!("failed to parse {}", self.path.display()))?;
        self.last_modified = tokio::fs::metadata(&self.path).await.ok().and_then(|m| m.modified().ok());
        Ok(())
    }

    async fn reload_if_changed(&mut self) {
        let modified = match tokio::fs::metadata(&self.path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), "cannot stat list file: {}", e);
                return;
            }
        };
        if self.last_modified == Some(modified) {
            return;
        }
        match self.load().await {
            Ok(()) => tracing::info!(path = %self.path.display(), "reloaded list"),
            Err(e) => tracing::warn!(path = %self.path.display(), "list reload failed, keeping previous contents: {:#}", e),
        }
    }
}

pub async fn run(mut lists: Vec<ReloadableList>, check_interval: Duration) -> anyhow::Result<()> {
    if lists.is_empty() {
        return Ok(());
    }
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; lists were already loaded at startup
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for list in &mut lists {
            list.reload_if_changed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::sync::Arc;

    #[tokio::test]
    async fn load_applies_file_contents() {
        let dir = std::env::temp_dir().join(format!("seal-dns-prefetch-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("list.txt");
        tokio::fs::write(&path, "one\ntwo\n").await.unwrap();

        let seen: Arc<RwLock<Vec<String>>> = Arc::new(RwLock::new(Vec::new()));
        let sink = seen.clone();
        let mut list = ReloadableList::new(
            path.clone(),
            Box::new(move |text| {
                *sink.write() = text.lines().map(str::to_string).collect();
                Ok(())
            }),
        );
        list.load().await.unwrap();
        assert_eq!(&*seen.read(), &["one", "two"]);

        // Unchanged mtime short-circuits
        list.reload_if_changed().await;
        assert_eq!(seen.read().len(), 2);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_fails_the_initial_load() {
        let mut list = ReloadableList::new(PathBuf::from("/nonexistent/list.txt"), Box::new(|_| Ok(())));
        assert!(list.load().await.is_err());
    }
}
