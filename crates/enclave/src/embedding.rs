use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use tracing::debug;

use crate::{
    config::IsolateOptions,
    engine::{DefaultEngine, Engine},
    error::{Error, Result},
    global::InitOnce,
    handles::{IsolateHandle, NativeModule},
    host::{Host, ManualHost},
    isolate::IsolateEnvironment,
};

struct EmbeddingInner {
    engine: Arc<dyn Engine>,
    host: Arc<dyn Host>,
    default_options: IsolateOptions,
    modules: RwLock<HashMap<String, Arc<dyn NativeModule>>>,
    engine_init: InitOnce,
}

/// The engine and hosting runtime isolates are created against.
#[derive(Clone)]
pub struct Embedding(Arc<EmbeddingInner>);

impl Embedding {
    #[must_use]
    pub fn builder() -> EmbeddingBuilder {
        EmbeddingBuilder::default()
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.0.engine
    }

    #[must_use]
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.0.host
    }

    #[must_use]
    pub fn default_options(&self) -> &IsolateOptions {
        &self.0.default_options
    }

    /// Run `f` against the engine the first time this is called.
    pub(crate) fn configure_engine(&self, f: impl FnOnce(&dyn Engine)) {
        self.0.engine_init.run(|| f(&*self.0.engine));
    }

    /// Add a module to the catalog `NativeModule` constructors resolve from.
    /// Replaces a module registered under the same name.
    pub fn register_native_module(&self, name: impl Into<String>, module: impl NativeModule) {
        let name = name.into();
        debug!(module = %name, "native module registered");
        self.0.modules.write().insert(name, Arc::new(module));
    }

    /// # Errors
    /// Returns [`Error::ModuleNotFound`] if nothing is registered as `name`.
    pub fn native_module(&self, name: &str) -> Result<Arc<dyn NativeModule>> {
        self.0
            .modules
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ModuleNotFound(name.to_string()))
    }

    /// Create a standalone isolate.
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the engine cannot host it.
    pub fn create_isolate(&self, options: &IsolateOptions) -> Result<IsolateHandle> {
        IsolateEnvironment::spawn(self, options, None).map(IsolateHandle::new)
    }
}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedding")
            .field("default_options", &self.0.default_options)
            .field("modules", &self.0.modules.read().len())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct EmbeddingBuilder {
    engine: Option<Arc<dyn Engine>>,
    host: Option<Arc<dyn Host>>,
    default_options: IsolateOptions,
    modules: HashMap<String, Arc<dyn NativeModule>>,
}

impl EmbeddingBuilder {
    /// Defaults to [`DefaultEngine`].
    #[must_use]
    pub fn engine(mut self, engine: impl Engine) -> Self {
        self.engine = Some(Arc::new(engine));
        self
    }

    /// Defaults to a [`ManualHost`] on a [`crate::ThreadPlatform`].
    #[must_use]
    pub fn host(mut self, host: impl Host) -> Self {
        self.host = Some(Arc::new(host));
        self
    }

    #[must_use]
    pub fn default_options(mut self, options: IsolateOptions) -> Self {
        self.default_options = options;
        self
    }

    #[must_use]
    pub fn native_module(mut self, name: impl Into<String>, module: impl NativeModule) -> Self {
        self.modules.insert(name.into(), Arc::new(module));
        self
    }

    #[must_use]
    pub fn build(self) -> Embedding {
        Embedding(Arc::new(EmbeddingInner {
            engine: self
                .engine
                .unwrap_or_else(|| Arc::new(DefaultEngine::new())),
            host: self.host.unwrap_or_else(|| Arc::new(ManualHost::new())),
            default_options: self.default_options,
            modules: RwLock::new(self.modules),
            engine_init: InitOnce::new(),
        }))
    }
}
