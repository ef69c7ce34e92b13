//! Manager: configuration-to-engine lifecycle with a process-wide default.
//!
//! A `Manager` holds at most one engine/target pair and serializes all
//! lifecycle mutation through one async mutex, so a half-constructed engine
//! is never observable. `Manager::global()` lends the process-wide default
//! instance; independent instances can be constructed directly for tests.

use crate::config::ConnectionTarget;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::schema::Schema;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

static GLOBAL: RwLock<Option<Arc<Manager>>> = RwLock::const_new(None);

/// Options for [`Manager::initialize`].
pub struct InitOptions {
    /// Start the engine immediately (default: true).
    pub auto_start: bool,
    /// Create this schema's objects after initialization.
    pub schema: Option<Arc<dyn Schema>>,
    /// Reset any existing engine instead of failing.
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            auto_start: true,
            schema: None,
            force: false,
        }
    }
}

impl InitOptions {
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

impl std::fmt::Debug for InitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitOptions")
            .field("auto_start", &self.auto_start)
            .field("schema", &self.schema.is_some())
            .field("force", &self.force)
            .finish()
    }
}

struct ManagerState {
    engine: Arc<Engine>,
    target: ConnectionTarget,
}

#[derive(Default)]
pub struct Manager {
    state: Mutex<Option<ManagerState>>,
    /// Guards against re-entrant resets; a concurrent reset is a no-op.
    resetting: AtomicBool,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

impl Manager {
    /// An independent, uninitialized manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default manager.
    ///
    /// Double-checked: the common path takes only a read lock, and a locked
    /// re-check before construction guarantees concurrent callers observe a
    /// single identity.
    pub async fn global() -> Arc<Manager> {
        if let Some(manager) = GLOBAL.read().await.as_ref() {
            return Arc::clone(manager);
        }
        let mut slot = GLOBAL.write().await;
        if let Some(manager) = slot.as_ref() {
            return Arc::clone(manager);
        }
        let manager = Arc::new(Manager::new());
        *slot = Some(Arc::clone(&manager));
        manager
    }

    /// Build (and by default start) the engine for `target`.
    ///
    /// Fails with [`Error::AlreadyInitialized`] when an engine already
    /// exists, unless `opts.force` replaces it. The check and the
    /// replacement happen under one lock, so a forced call cannot lose a
    /// race with a concurrent `initialize`. When `opts.schema` is set its
    /// objects are created, starting the engine if needed.
    pub async fn initialize(&self, target: ConnectionTarget, opts: InitOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.take() {
            if !opts.force {
                *state = Some(existing);
                return Err(Error::AlreadyInitialized);
            }
            existing.engine.stop().await;
            info!("Existing engine replaced by forced initialize");
        }
        let engine = Arc::new(Engine::new(target.clone())?);
        if opts.auto_start {
            engine.start().await?;
        }
        if let Some(schema) = opts.schema {
            if !engine.is_alive().await {
                engine.start().await?;
            }
            engine.create_tables(schema).await?;
        }
        info!(dialect = %target.dialect, database = %target.database, "Manager initialized");
        *state = Some(ManagerState { engine, target });
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Start the held engine. [`Error::NotInitialized`] when none exists.
    pub async fn start(&self) -> Result<()> {
        let state = self.state.lock().await;
        match state.as_ref() {
            Some(state) => state.engine.start().await,
            None => Err(Error::NotInitialized),
        }
    }

    /// Stop the held engine. No-op when uninitialized; never raises.
    pub async fn stop(&self) {
        if let Some(state) = self.state.lock().await.as_ref() {
            state.engine.stop().await;
        }
    }

    /// Stop and discard the engine and target. With `full`, also clear this
    /// manager out of the global slot so the next `global()` builds fresh.
    pub async fn reset(&self, full: bool) {
        if self.resetting.swap(true, Ordering::SeqCst) {
            warn!("Reset already in progress, skipping");
            return;
        }
        let state = self.state.lock().await.take();
        if let Some(state) = state {
            state.engine.stop().await;
            info!("Manager reset");
        }
        if full {
            let mut slot = GLOBAL.write().await;
            if slot
                .as_ref()
                .is_some_and(|global| std::ptr::eq(Arc::as_ptr(global), self))
            {
                *slot = None;
            }
        }
        self.resetting.store(false, Ordering::SeqCst);
    }

    /// Swap in a new target, stopping any previous engine first. Also
    /// serves as plain initialization when nothing was configured yet.
    pub async fn reload_config(&self, target: ConnectionTarget, restart: bool) -> Result<()> {
        let engine = Arc::new(Engine::new(target.clone())?);
        let mut state = self.state.lock().await;
        if let Some(old) = state.take() {
            old.engine.stop().await;
        }
        *state = Some(ManagerState {
            engine: Arc::clone(&engine),
            target,
        });
        drop(state);
        if restart {
            engine.start().await?;
        }
        Ok(())
    }

    /// The held engine, or [`Error::NotInitialized`].
    pub async fn engine(&self) -> Result<Arc<Engine>> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|state| Arc::clone(&state.engine))
            .ok_or(Error::NotInitialized)
    }

    /// A copy of the configured target, if any.
    pub async fn target(&self) -> Option<ConnectionTarget> {
        self.state.lock().await.as_ref().map(|state| state.target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uninitialized_manager() {
        let manager = Manager::new();
        assert!(!manager.is_initialized().await);
        assert!(matches!(manager.engine().await, Err(Error::NotInitialized)));
        assert!(matches!(manager.start().await, Err(Error::NotInitialized)));
        // stop and reset are safe without an engine.
        manager.stop().await;
        manager.reset(false).await;
    }

    #[tokio::test]
    async fn test_initialize_and_double_initialize() {
        let manager = Manager::new();
        manager
            .initialize(ConnectionTarget::sqlite(":memory:"), InitOptions::default())
            .await
            .unwrap();
        assert!(manager.is_initialized().await);
        assert!(manager.engine().await.unwrap().is_alive().await);

        let err = manager
            .initialize(ConnectionTarget::sqlite(":memory:"), InitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized));

        // force replaces the engine instead of failing.
        manager
            .initialize(
                ConnectionTarget::sqlite(":memory:"),
                InitOptions::default().force(true),
            )
            .await
            .unwrap();
        manager.reset(false).await;
    }

    #[tokio::test]
    async fn test_initialize_without_auto_start() {
        let manager = Manager::new();
        manager
            .initialize(
                ConnectionTarget::sqlite(":memory:"),
                InitOptions::default().auto_start(false),
            )
            .await
            .unwrap();
        assert!(!manager.engine().await.unwrap().is_alive().await);
        manager.reset(false).await;
    }

    #[tokio::test]
    async fn test_reset_discards_engine() {
        let manager = Manager::new();
        manager
            .initialize(ConnectionTarget::sqlite(":memory:"), InitOptions::default())
            .await
            .unwrap();
        manager.reset(false).await;
        assert!(!manager.is_initialized().await);
        // Reset is idempotent.
        manager.reset(false).await;
    }

    #[tokio::test]
    async fn test_reload_config_initializes_when_empty() {
        let manager = Manager::new();
        manager
            .reload_config(ConnectionTarget::sqlite(":memory:"), true)
            .await
            .unwrap();
        assert!(manager.is_initialized().await);
        assert!(manager.engine().await.unwrap().is_alive().await);
        manager.reset(false).await;
    }

    #[tokio::test]
    async fn test_invalid_target_rejected() {
        let manager = Manager::new();
        let err = manager
            .initialize(ConnectionTarget::sqlite(""), InitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(!manager.is_initialized().await);
    }
}
