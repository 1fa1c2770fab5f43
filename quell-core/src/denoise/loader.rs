//! Module loading strategies.
//!
//! Strategies are tried in order and the first success wins:
//! bundled weights file, then the weights compiled into the binary, then a
//! remote download (only with the `remote-model` feature). When every
//! strategy fails the aggregated error names each attempt.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use super::{NeuralModule, RnnoiseModule};
use crate::config::EngineConfig;
use crate::error::{QuellError, Result};

type ModuleCtor = dyn Fn() -> Result<Box<dyn NeuralModule>> + Send + Sync;

/// A successfully loaded module that can be instantiated any number of times.
///
/// Every stream and every chunk finalizer gets its own instance, so recurrent
/// state is never shared between independent audio paths.
#[derive(Clone)]
pub struct LoadedModule {
    strategy: &'static str,
    ctor: Arc<ModuleCtor>,
}

impl LoadedModule {
    pub fn from_fn<F>(strategy: &'static str, ctor: F) -> Self
    where
        F: Fn() -> Result<Box<dyn NeuralModule>> + Send + Sync + 'static,
    {
        Self {
            strategy,
            ctor: Arc::new(ctor),
        }
    }

    /// Module backed by an in-memory RNNoise weights blob.
    pub fn from_weights(strategy: &'static str, bytes: Vec<u8>) -> Result<Self> {
        // Parse once up front so a corrupt file fails the loader, not the stream.
        RnnoiseModule::from_weights(&bytes)?;
        let bytes: Arc<[u8]> = bytes.into();
        Ok(Self::from_fn(strategy, move || {
            Ok(Box::new(RnnoiseModule::from_weights(&bytes)?) as Box<dyn NeuralModule>)
        }))
    }

    pub fn instantiate(&self) -> Result<Box<dyn NeuralModule>> {
        (self.ctor)()
    }

    pub fn strategy(&self) -> &'static str {
        self.strategy
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

pub trait ModuleLoader: Send + Sync {
    fn strategy(&self) -> &'static str;

    /// Blocking; run on a blocking thread under the load timeout.
    fn load(&self) -> Result<LoadedModule>;
}

/// Weights file shipped alongside the application.
#[derive(Debug, Clone)]
pub struct BundledLoader {
    pub path: PathBuf,
}

impl ModuleLoader for BundledLoader {
    fn strategy(&self) -> &'static str {
        "bundled"
    }

    fn load(&self) -> Result<LoadedModule> {
        if !self.path.exists() {
            return Err(QuellError::ModuleLoad(format!(
                "weights file not found: {}",
                self.path.display()
            )));
        }
        let bytes = std::fs::read(&self.path)?;
        LoadedModule::from_weights(self.strategy(), bytes)
    }
}

/// Weights compiled into `nnnoiseless`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedLoader;

impl ModuleLoader for EmbeddedLoader {
    fn strategy(&self) -> &'static str {
        "embedded"
    }

    fn load(&self) -> Result<LoadedModule> {
        Ok(LoadedModule::from_fn(self.strategy(), || {
            Ok(Box::new(RnnoiseModule::new()) as Box<dyn NeuralModule>)
        }))
    }
}

/// Weights downloaded over HTTP(S).
#[derive(Debug, Clone)]
pub struct RemoteLoader {
    pub url: String,
}

impl ModuleLoader for RemoteLoader {
    fn strategy(&self) -> &'static str {
        "remote"
    }

    #[cfg(feature = "remote-model")]
    fn load(&self) -> Result<LoadedModule> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .map_err(|e| QuellError::Network(format!("client build failed: {e}")))?;
        let response = client
            .get(&self.url)
            .send()
            .map_err(|e| QuellError::Network(format!("GET {} failed: {e}", self.url)))?;
        if !response.status().is_success() {
            return Err(QuellError::Network(format!(
                "GET {} returned {}",
                self.url,
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .map_err(|e| QuellError::Network(format!("reading body of {}: {e}", self.url)))?;
        info!(url = %self.url, bytes = bytes.len(), "downloaded denoiser weights");
        LoadedModule::from_weights(self.strategy(), bytes.to_vec())
    }

    #[cfg(not(feature = "remote-model"))]
    fn load(&self) -> Result<LoadedModule> {
        Err(QuellError::Unsupported(format!(
            "remote weights ({}) require the `remote-model` feature",
            self.url
        )))
    }
}

/// Loader chain derived from configuration.
pub fn default_loaders(config: &EngineConfig) -> Vec<Box<dyn ModuleLoader>> {
    let mut loaders: Vec<Box<dyn ModuleLoader>> = Vec::with_capacity(3);
    if let Some(path) = &config.model_path {
        loaders.push(Box::new(BundledLoader { path: path.clone() }));
    }
    loaders.push(Box::new(EmbeddedLoader));
    if let Some(url) = &config.model_url {
        loaders.push(Box::new(RemoteLoader { url: url.clone() }));
    }
    loaders
}

/// Try each loader in order; the first success wins.
pub fn load_first(loaders: &[Box<dyn ModuleLoader>]) -> Result<LoadedModule> {
    let mut failures = Vec::with_capacity(loaders.len());
    for loader in loaders {
        match loader.load() {
            Ok(module) => {
                info!(strategy = loader.strategy(), "denoiser module loaded");
                return Ok(module);
            }
            Err(e) => {
                warn!(strategy = loader.strategy(), error = %e, "module loader failed");
                failures.push(format!("{}: {e}", loader.strategy()));
            }
        }
    }
    if failures.is_empty() {
        return Err(QuellError::ModuleLoad("no module loaders configured".into()));
    }
    Err(QuellError::ModuleLoad(format!(
        "all loading strategies failed ({})",
        failures.join("; ")
    )))
}
