//! Named sessions and the registry that owns them.
//!
//! A session is one shared memory image plus its watch broker. The
//! registry maps validated session names to sessions, creating them
//! lazily on first reference. It is an explicit, injected object —
//! never ambient global state — so tests can run isolated registries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::broadcast::WatchBroker;
use crate::region::{MemoryRegion, DEFAULT_CAPACITY};

/// File extension for session backing files in the data directory.
pub const REGION_FILE_EXT: &str = "mem";

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Name contains characters outside the safe set.
    BadName(String),
    /// Backing storage could not be allocated or opened.
    Io(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadName(name) => write!(f, "invalid session name {name:?}"),
            Self::Io(e) => write!(f, "session storage error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Case-fold and validate a session name.
///
/// Allowed characters after folding: `a-z`, `0-9`, `_`, `-`. Anything
/// else (path separators included) is rejected before any session or
/// backing file is created.
pub fn normalize_name(raw: &str) -> Result<String, SessionError> {
    let name = raw.to_ascii_lowercase();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(name)
    } else {
        Err(SessionError::BadName(raw.to_string()))
    }
}

/// One named memory image and its watchers.
pub struct Session {
    name: String,
    region: Arc<MemoryRegion>,
    broker: Arc<WatchBroker>,
    /// Set when the backing storage was freshly allocated; reported to
    /// at most the first greeting request, then cleared. Lets a newly
    /// connecting client distinguish "seed me" from "just load".
    init_needed: AtomicBool,
}

impl Session {
    fn new(name: String, region: MemoryRegion, init_needed: bool) -> Self {
        Self {
            name,
            region: Arc::new(region),
            broker: Arc::new(WatchBroker::new()),
            init_needed: AtomicBool::new(init_needed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    pub fn broker(&self) -> &Arc<WatchBroker> {
        &self.broker
    }

    /// Report and clear the initialization flag.
    pub fn take_init_needed(&self) -> bool {
        self.init_needed.swap(false, Ordering::SeqCst)
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of every session's memory region.
    pub region_capacity: usize,
    /// Data directory for backing files (None = in-memory only).
    pub data_dir: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            region_capacity: DEFAULT_CAPACITY,
            data_dir: None,
        }
    }
}

/// Maps session names to sessions, creating them on first reference.
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RegistryConfig::default())
    }

    /// Resolve a session by name, creating it if it does not exist.
    ///
    /// Concurrent resolves of the same new name create exactly one
    /// session.
    pub async fn resolve(&self, raw: &str) -> Result<Arc<Session>, SessionError> {
        let name = normalize_name(raw)?;

        // Fast path: read lock.
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&name) {
                return Ok(session.clone());
            }
        }

        // Slow path: write lock to create.
        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring the write lock.
        if let Some(session) = sessions.get(&name) {
            return Ok(session.clone());
        }

        let (region, init_needed) = self.open_region(&name)?;
        let session = Arc::new(Session::new(name.clone(), region, init_needed));
        sessions.insert(name.clone(), session.clone());
        log::info!(
            "session {name} created ({} bytes, persistent: {}, init needed: {init_needed})",
            session.region().capacity(),
            session.region().is_persistent(),
        );
        Ok(session)
    }

    /// Look up an existing session without creating one.
    pub async fn get(&self, raw: &str) -> Option<Arc<Session>> {
        let name = normalize_name(raw).ok()?;
        self.sessions.read().await.get(&name).cloned()
    }

    /// Names of all live sessions.
    pub async fn sessions(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every session's broker so all in-flight drains unblock.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            session.broker().shutdown();
        }
        log::info!("registry shut down ({} sessions signaled)", sessions.len());
    }

    fn open_region(&self, name: &str) -> Result<(MemoryRegion, bool), SessionError> {
        match &self.config.data_dir {
            None => Ok((MemoryRegion::new(self.config.region_capacity), true)),
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| SessionError::Io(e.to_string()))?;
                let path = dir.join(format!("{name}.{REGION_FILE_EXT}"));
                MemoryRegion::open(&path, self.config.region_capacity)
                    .map_err(|e| SessionError::Io(e.to_string()))
            }
        }
    }
}
