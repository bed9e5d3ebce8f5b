//! Filesystem-backed trigger, built on top of a per-directory observer
//! multiplexer: many subscribers watching glob patterns under the same root
//! directory share a single underlying `notify` watcher, and the watcher is
//! torn down as soon as its last subscriber unsubscribes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use super::Trigger;

struct Subscriber {
    id: u64,
    patterns: Vec<glob::Pattern>,
    callback: Arc<dyn Fn() + Send + Sync>,
}

struct RootObserver {
    // Held only to keep the underlying OS watch alive; dropping it tears
    // down the watch.
    _watcher: notify::RecommendedWatcher,
    subscribers: Arc<Mutex<Vec<Arc<Subscriber>>>>,
}

impl RootObserver {
    fn start(root: &Path) -> notify::Result<Self> {
        use notify::Watcher;

        let subscribers: Arc<Mutex<Vec<Arc<Subscriber>>>> = Arc::new(Mutex::new(Vec::new()));
        let dispatch = Arc::clone(&subscribers);
        let root_for_handler = root.to_path_buf();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            // Snapshot under the lock, then dispatch without holding it: a
            // callback may itself subscribe or unsubscribe.
            let subs = dispatch.lock().unwrap().clone();
            for path in &event.paths {
                let Ok(rel) = path.strip_prefix(&root_for_handler) else {
                    continue;
                };
                for sub in &subs {
                    if sub.patterns.iter().any(|pattern| pattern.matches_path(rel)) {
                        (sub.callback)();
                    }
                }
            }
        })?;
        watcher.watch(root, notify::RecursiveMode::Recursive)?;

        Ok(RootObserver {
            _watcher: watcher,
            subscribers,
        })
    }
}

struct Multiplexer {
    roots: Mutex<HashMap<PathBuf, Arc<RootObserver>>>,
}

static MULTIPLEXER: Lazy<Multiplexer> = Lazy::new(|| Multiplexer {
    roots: Mutex::new(HashMap::new()),
});

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(0);

struct Subscription {
    root: PathBuf,
    id: u64,
}

impl Multiplexer {
    fn subscribe(
        &self,
        root: &Path,
        patterns: &[String],
        callback: Arc<dyn Fn() + Send + Sync>,
    ) -> eyre::Result<Subscription> {
        let mut roots = self.roots.lock().unwrap();
        let observer = match roots.get(root) {
            Some(observer) => Arc::clone(observer),
            None => {
                let observer = Arc::new(RootObserver::start(root)?);
                roots.insert(root.to_path_buf(), Arc::clone(&observer));
                observer
            }
        };
        drop(roots);

        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::SeqCst);
        let patterns = patterns
            .iter()
            .filter_map(|pattern| glob::Pattern::new(pattern).ok())
            .collect();
        observer
            .subscribers
            .lock()
            .unwrap()
            .push(Arc::new(Subscriber { id, patterns, callback }));

        Ok(Subscription {
            root: root.to_path_buf(),
            id,
        })
    }

    fn unsubscribe(&self, subscription: Subscription) {
        let mut roots = self.roots.lock().unwrap();
        let now_empty = match roots.get(&subscription.root) {
            Some(observer) => {
                let mut subs = observer.subscribers.lock().unwrap();
                subs.retain(|sub| sub.id != subscription.id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            roots.remove(&subscription.root);
        }
    }
}

/// Watches one or more glob patterns under a root directory. A pattern may
/// be a literal known up front (e.g. `refs/heads/*`) or a closure resolved
/// each time the watcher arms (e.g. one that reads a branch's `full_name`
/// cell to build `logs/<full-name>`) — this is the "carrier object"
/// substitution the kernel contract describes, expressed as a closure
/// instead of a template string.
pub struct PathWatcher {
    root: PathBuf,
    patterns: Vec<Box<dyn Fn() -> String + Send + Sync>>,
    subscription: Mutex<Option<Subscription>>,
}

impl PathWatcher {
    /// Creates a watcher with no patterns yet, rooted at `root`. `root`
    /// should be a directory that exists and is a sensible place to install
    /// an OS watch (e.g. a repository's control directory); patterns are
    /// matched against paths relative to it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        PathWatcher {
            root: root.into(),
            patterns: Vec::new(),
            subscription: Mutex::new(None),
        }
    }

    /// Adds a pattern that is the same every time this watcher arms.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        self.patterns.push(Box::new(move || pattern.clone()));
        self
    }

    /// Adds a pattern resolved by calling `resolve` each time this watcher
    /// arms, rather than a fixed string.
    pub fn with_dynamic_pattern(mut self, resolve: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.patterns.push(Box::new(resolve));
        self
    }
}

impl Trigger for PathWatcher {
    fn arm(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        let resolved: Vec<String> = self.patterns.iter().map(|resolve| resolve()).collect();
        match MULTIPLEXER.subscribe(&self.root, &resolved, callback) {
            Ok(subscription) => {
                *self.subscription.lock().unwrap() = Some(subscription);
            }
            Err(error) => {
                tracing::warn!(root = %self.root.display(), %error, "failed to arm path watcher");
            }
        }
    }

    fn disarm(&self) {
        if let Some(subscription) = self.subscription.lock().unwrap().take() {
            MULTIPLEXER.unsubscribe(subscription);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn fires_on_matching_file_event() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = PathWatcher::new(dir.path()).with_pattern("refs/heads/*");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let callback: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        watcher.arm(callback);

        std::fs::create_dir_all(dir.path().join("refs/heads")).unwrap();
        std::fs::write(dir.path().join("refs/heads/main"), b"deadbeef\n").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while fired.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(fired.load(Ordering::SeqCst) > 0);

        watcher.disarm();
    }

    #[test]
    fn dynamic_pattern_is_resolved_at_arm_time() {
        let dir = tempfile::tempdir().unwrap();
        let name = Arc::new(Mutex::new("first".to_string()));
        let name2 = Arc::clone(&name);
        let watcher = PathWatcher::new(dir.path())
            .with_dynamic_pattern(move || format!("{}/*", name2.lock().unwrap()));

        *name.lock().unwrap() = "second".to_string();
        let callback: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        watcher.arm(callback);
        watcher.disarm();
    }
}
