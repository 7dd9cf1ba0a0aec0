use crate::assets::DirectoryAssets;
use crate::channel::ErrorChannel;
use crate::config::BridgeConfig;
use crate::marshal::{Arg, CallDescriptor, Marshaler};
use crate::platform::{BundledLoader, DesktopLoader, PlatformLoader};
use crate::registry::{LibraryHandle, Registry, RuntimePaths};
use crate::value::{Marshal, Value};
use crate::{BridgeError, Result};
use log::info;
use std::sync::Arc;

/// All bridge state for one application. Created once by the entry point and
/// handed to whoever makes calls; it is `Sync`, so sharing it across threads
/// by reference or `Arc` is fine.
pub struct BridgeContext {
    config: BridgeConfig,
    registry: Registry,
    marshaler: Marshaler,
}

impl BridgeContext {
    pub fn new(config: BridgeConfig, loader: Box<dyn PlatformLoader>) -> Result<Self> {
        Self::with_paths(config, loader, None)
    }

    /// Pick the loader the config describes: bundled when an asset directory
    /// is set, plain filesystem search otherwise.
    pub fn from_config(config: BridgeConfig) -> Result<Self> {
        let native = match config.library_search_paths.as_slice() {
            [] => DesktopLoader::new(DesktopLoader::default_search_paths()),
            paths => DesktopLoader::new(paths.to_vec()),
        };

        match config.asset_dir.clone() {
            Some(asset_dir) => {
                let loader = BundledLoader::new(
                    Box::new(DirectoryAssets::new(asset_dir)),
                    config.extraction_dir(),
                    native,
                )
                .with_runtime_assemblies(config.runtime_assemblies.clone());
                let runtime_dir = (!config.runtime_assemblies.is_empty()).then(|| loader.runtime_assembly_dir());
                info!("Using bundled assemblies, unpacking to {:?}", config.extraction_dir());
                Self::with_paths(config, Box::new(loader), runtime_dir)
            }
            None => Self::new(config, Box::new(native)),
        }
    }

    fn with_paths(
        config: BridgeConfig,
        loader: Box<dyn PlatformLoader>,
        runtime_fallback: Option<std::path::PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let channel = ErrorChannel::new();
        let paths = RuntimePaths {
            assembly_path: config.assembly_path.clone(),
            runtime_assembly_path: config.runtime_assembly_path.clone().or(runtime_fallback),
        };
        let registry = Registry::new(loader, channel.clone(), paths);
        let marshaler = Marshaler::new(channel, config.string_ownership());
        Ok(Self {
            config,
            registry,
            marshaler,
        })
    }

    pub fn resolve(&self, library: &str) -> Result<Arc<LibraryHandle>> {
        self.registry.resolve(library)
    }

    /// Resolve `library` and call into it.
    pub fn invoke(&self, library: &str, call: &CallDescriptor, args: &mut [Arg<'_>]) -> Result<Value> {
        let handle = self.resolve(library)?;
        self.marshaler.invoke(&handle, call, args)
    }

    /// Like [`invoke`](Self::invoke), converting the return value to `R`.
    pub fn call<R: Marshal>(&self, library: &str, call: &CallDescriptor, args: &mut [Arg<'_>]) -> Result<R> {
        let declared = &call.method().signature.ret;
        if *declared != R::value_type() {
            return Err(BridgeError::Marshal(format!(
                "{} returns {}, caller expects {}",
                call.method(),
                declared,
                R::value_type()
            )));
        }
        R::from_value(self.invoke(library, call, args)?)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn channel(&self) -> &ErrorChannel {
        self.registry.channel()
    }

    pub fn marshaler(&self) -> &Marshaler {
        &self.marshaler
    }
}
