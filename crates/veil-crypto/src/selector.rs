//! Backend selection.
//!
//! [`CryptoBackendSelector::initialize`] picks the native engine when it
//! loads and passes its self-test, and the software engine otherwise. The
//! choice is made once: concurrent callers share the single in-flight
//! attempt and every later call returns the same [`Engine`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use crate::backend::software::SoftwareEngine;
use crate::backend::{BackendKind, CryptoEngine};
use crate::config::CryptoConfig;
use crate::error::CryptoError;

/// Shared handle to the active engine.
#[derive(Clone)]
pub struct Engine(Arc<dyn CryptoEngine>);

impl Engine {
    pub fn new(engine: Arc<dyn CryptoEngine>) -> Self {
        Self(engine)
    }

    /// Software engine, after its AEAD probe. Fails hard when the probe does.
    pub fn software() -> Result<Self, CryptoError> {
        SoftwareEngine::probe().map_err(|e| match e {
            CryptoError::NoSecureBackend(_) => e,
            other => CryptoError::NoSecureBackend(other.to_string()),
        })?;
        Ok(Self(Arc::new(SoftwareEngine::new())))
    }

    /// Native engine, after its self-test. Blocking.
    #[cfg(feature = "native")]
    pub fn native() -> Result<Self, CryptoError> {
        let engine = crate::backend::native::NativeEngine::new();
        engine
            .self_test()
            .map_err(|e| CryptoError::Initialization(e.to_string()))?;
        Ok(Self(Arc::new(engine)))
    }

    pub fn kind(&self) -> BackendKind {
        self.0.kind()
    }

    pub fn is_native(&self) -> bool {
        self.kind() == BackendKind::Native
    }

    pub(crate) fn inner(&self) -> &dyn CryptoEngine {
        self.0.as_ref()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Engine").field(&self.kind()).finish()
    }
}

/// How engines are obtained. Swappable so tests can observe and fail loads.
#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn load_native(&self) -> Result<Engine, CryptoError>;
    async fn load_fallback(&self) -> Result<Engine, CryptoError>;
}

/// Loads vodozemac when compiled in, unless configuration forces the fallback.
#[derive(Debug, Default)]
pub struct DefaultLoader {
    force_fallback: bool,
}

impl DefaultLoader {
    pub fn new(force_fallback: bool) -> Self {
        Self { force_fallback }
    }
}

#[cfg(feature = "native")]
async fn load_native_engine() -> Result<Engine, CryptoError> {
    // The self-test panicking is a load failure like any other.
    match tokio::task::spawn_blocking(Engine::native).await {
        Ok(result) => result,
        Err(e) => Err(CryptoError::Initialization(format!(
            "native self-test aborted: {e}"
        ))),
    }
}

#[cfg(not(feature = "native"))]
async fn load_native_engine() -> Result<Engine, CryptoError> {
    Err(CryptoError::Initialization(
        "built without the native engine".into(),
    ))
}

#[async_trait]
impl EngineLoader for DefaultLoader {
    async fn load_native(&self) -> Result<Engine, CryptoError> {
        if self.force_fallback {
            return Err(CryptoError::Initialization(
                "native engine disabled by configuration".into(),
            ));
        }
        load_native_engine().await
    }

    async fn load_fallback(&self) -> Result<Engine, CryptoError> {
        Engine::software()
    }
}

pub struct CryptoBackendSelector {
    loader: Arc<dyn EngineLoader>,
    engine: OnceCell<Engine>,
}

impl CryptoBackendSelector {
    pub fn new(config: &CryptoConfig) -> Self {
        Self::with_loader(Arc::new(DefaultLoader::new(config.force_fallback)))
    }

    pub fn with_loader(loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            loader,
            engine: OnceCell::new(),
        }
    }

    /// Select the engine, or return the one already selected.
    ///
    /// A failed attempt leaves nothing cached, so a later call tries again.
    pub async fn initialize(&self) -> Result<Engine, CryptoError> {
        self.engine.get_or_try_init(|| self.select()).await.cloned()
    }

    #[instrument(skip(self))]
    async fn select(&self) -> Result<Engine, CryptoError> {
        let engine = match self.loader.load_native().await {
            Ok(engine) => engine,
            Err(e) => {
                warn!(error = %e, "native engine unavailable, using software engine");
                self.loader.load_fallback().await?
            }
        };
        info!(backend = %engine.kind(), "crypto backend ready");
        Ok(engine)
    }

    /// The selected engine, if initialization has completed.
    pub fn engine(&self) -> Option<Engine> {
        self.engine.get().cloned()
    }

    pub fn is_available(&self) -> bool {
        self.engine.initialized()
    }

    pub fn is_native_active(&self) -> bool {
        self.engine.get().is_some_and(Engine::is_native)
    }
}

impl fmt::Debug for CryptoBackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoBackendSelector")
            .field("engine", &self.engine.get())
            .finish_non_exhaustive()
    }
}
