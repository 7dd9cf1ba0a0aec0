use crate::channel::{ErrorChannel, ErrorRecord};
use crate::platform::{NativeModule, PlatformLoader};
use crate::{BridgeError, Result};
use abi::{ErrorKind, InvokeFn, SetAssemblyPathFn, StringFreeFn};
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loaded,
    Failed(String),
}

/// One native library known to the registry.
pub struct LibraryHandle {
    name: String,
    path: PathBuf,
    assembly_path: Option<PathBuf>,
    state: LoadState,
    module: Option<Box<dyn NativeModule>>,
    entry_points: RwLock<HashMap<String, usize>>,
    /// Last failed attempt to configure the runtime through this library.
    /// Cleared by the next resolution that finds the runtime ready.
    setup_failure: RwLock<Option<String>>,
    initialized: OnceCell<std::result::Result<(), String>>,
}

impl LibraryHandle {
    fn new(name: &str, path: PathBuf, assembly_path: Option<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path,
            assembly_path,
            state: LoadState::Unloaded,
            module: None,
            entry_points: RwLock::new(HashMap::new()),
            setup_failure: RwLock::new(None),
            initialized: OnceCell::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_module(name: &str, module: Box<dyn NativeModule>) -> Self {
        let mut handle = Self::new(name, PathBuf::from(name), None);
        handle.module = Some(module);
        handle.state = LoadState::Loaded;
        handle
    }

    fn attempt_load(&mut self, loader: &dyn PlatformLoader) {
        match loader.load(&self.path) {
            Ok(module) => {
                info!("Loaded library {} from {:?}", self.name, self.path);
                self.module = Some(module);
                self.state = LoadState::Loaded;
            }
            Err(e) => {
                error!("Failed to load library {} from {:?}: {}", self.name, self.path, e);
                self.state = LoadState::Failed(failure_reason(&e));
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the managed assembly for this library was unpacked, if anywhere.
    pub fn assembly_path(&self) -> Option<&Path> {
        self.assembly_path.as_deref()
    }

    /// Load state as seen by callers. A loaded library whose initializer
    /// failed, or through which the runtime could not be configured, reports
    /// `Failed` as well.
    pub fn state(&self) -> LoadState {
        if self.state != LoadState::Loaded {
            return self.state.clone();
        }
        if let Some(Err(reason)) = self.initialized.get() {
            return LoadState::Failed(reason.clone());
        }
        match &*self.setup_failure.read().unwrap_or_else(PoisonError::into_inner) {
            Some(reason) => LoadState::Failed(reason.clone()),
            None => LoadState::Loaded,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == LoadState::Loaded
    }

    fn load_failure(&self) -> Option<String> {
        match &self.state {
            LoadState::Loaded => None,
            LoadState::Failed(reason) => Some(reason.clone()),
            LoadState::Unloaded => Some("library is not loaded".into()),
        }
    }

    fn record_setup_failure(&self, failure: Option<String>) {
        let stale = self
            .setup_failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if stale || failure.is_some() {
            *self.setup_failure.write().unwrap_or_else(PoisonError::into_inner) = failure;
        }
    }

    pub fn symbol(&self, name: &str) -> Option<*const c_void> {
        self.module
            .as_ref()?
            .symbol(name)
            .filter(|address| !address.is_null())
    }

    /// Entry point of an exported member; cached after the first lookup.
    pub(crate) fn entry_point(&self, symbol: &str) -> Result<InvokeFn> {
        let cached = self
            .entry_points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .copied();

        let address = match cached {
            Some(address) => address,
            None => {
                let address = self.symbol(symbol).ok_or_else(|| {
                    BridgeError::MethodLookupFailed(ErrorRecord::new(
                        ErrorKind::MethodLookupFailed,
                        format!("{} does not export {}", self.name, symbol),
                    ))
                })? as usize;
                self.entry_points
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(symbol.to_string(), address);
                address
            }
        };
        // SAFETY: exported members follow the InvokeFn convention of ABI revision 4.
        Ok(unsafe { std::mem::transmute::<*const c_void, InvokeFn>(address as *const c_void) })
    }

    pub(crate) fn string_free(&self) -> Option<StringFreeFn> {
        let address = self.symbol(abi::symbols::STRING_FREE)?;
        // SAFETY: signature fixed by ABI revision 4.
        Some(unsafe { std::mem::transmute::<*const c_void, StringFreeFn>(address) })
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("assembly_path", &self.assembly_path)
            .field("state", &self.state())
            .finish()
    }
}

/// Runs once per loaded library, after the runtime has its error hook and
/// assembly paths. It may call into the library but must not resolve the
/// same name again.
pub type Initializer = Arc<dyn Fn(&LibraryHandle) -> anyhow::Result<()> + Send + Sync>;

/// Paths handed to the runtime on first resolution. Unset entries fall back
/// to whatever the loader unpacked.
#[derive(Debug, Clone, Default)]
pub struct RuntimePaths {
    pub assembly_path: Option<PathBuf>,
    pub runtime_assembly_path: Option<PathBuf>,
}

/// Maps logical library names to loaded modules, loading each at most once.
pub struct Registry {
    loader: Box<dyn PlatformLoader>,
    channel: ErrorChannel,
    paths: RuntimePaths,
    handles: RwLock<HashMap<String, Arc<LibraryHandle>>>,
    load_lock: Mutex<()>,
    initializers: Mutex<HashMap<String, Initializer>>,
    runtime_ready: OnceCell<()>,
}

impl Registry {
    pub fn new(loader: Box<dyn PlatformLoader>, channel: ErrorChannel, paths: RuntimePaths) -> Self {
        Self {
            loader,
            channel,
            paths,
            handles: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
            initializers: Mutex::new(HashMap::new()),
            runtime_ready: OnceCell::new(),
        }
    }

    pub fn register_initializer<F>(&self, name: impl Into<String>, init: F)
    where
        F: Fn(&LibraryHandle) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.initializers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(init));
    }

    /// Resolve `name` to a loaded library.
    ///
    /// The first successful resolution also installs the error channel into
    /// that library and hands it the assembly search paths. A library's
    /// initializer runs only once that has happened.
    pub fn resolve(&self, name: &str) -> Result<Arc<LibraryHandle>> {
        let handle = match self.lookup(name) {
            Some(handle) => handle,
            None => self.resolve_slow(name)?,
        };

        if let Some(reason) = handle.load_failure() {
            return Err(BridgeError::LoadFailed {
                name: name.to_string(),
                reason,
            });
        }

        // a failed bootstrap is retried by the next resolution
        if let Err(e) = self.runtime_ready.get_or_try_init(|| self.bootstrap(&handle)) {
            handle.record_setup_failure(Some(failure_reason(&e)));
            return Err(e);
        }
        handle.record_setup_failure(None);

        if let Err(reason) = handle.initialized.get_or_init(|| self.run_initializer(&handle)) {
            return Err(BridgeError::LoadFailed {
                name: name.to_string(),
                reason: reason.clone(),
            });
        }
        Ok(handle)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<LibraryHandle>> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Forget a library so the next `resolve` tries again. Existing handles
    /// stay usable.
    pub fn evict(&self, name: &str) -> Option<Arc<LibraryHandle>> {
        let _guard = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let evicted = self
            .handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if evicted.is_some() {
            debug!("Evicted library {}", name);
        }
        evicted
    }

    pub fn handles(&self) -> Vec<Arc<LibraryHandle>> {
        let mut handles: Vec<_> = self
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    pub fn channel(&self) -> &ErrorChannel {
        &self.channel
    }

    fn resolve_slow(&self, name: &str) -> Result<Arc<LibraryHandle>> {
        let _guard = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // another thread may have finished while we waited
        if let Some(handle) = self.lookup(name) {
            return Ok(handle);
        }

        let path = self.loader.resolve_library(name)?;
        let assembly_path = self.loader.extract_resource(name)?;

        let mut handle = LibraryHandle::new(name, path, assembly_path);
        handle.attempt_load(self.loader.as_ref());

        let handle = Arc::new(handle);
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    fn run_initializer(&self, handle: &LibraryHandle) -> std::result::Result<(), String> {
        let init = self
            .initializers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.name)
            .cloned();
        let Some(init) = init else {
            return Ok(());
        };
        debug!("Running initializer for {}", handle.name);
        init(handle).map_err(|e| {
            error!("Initializer for {} failed: {:#}", handle.name, e);
            format!("initializer failed: {:#}", e)
        })
    }

    fn bootstrap(&self, handle: &LibraryHandle) -> Result<()> {
        self.channel.install(handle)?;

        let assembly_path = self
            .paths
            .assembly_path
            .clone()
            .or_else(|| handle.assembly_path().map(Path::to_path_buf));
        if let Some(path) = &assembly_path {
            let setter = handle.symbol(abi::symbols::SET_ASSEMBLY_PATH).ok_or_else(|| {
                BridgeError::LoadFailed {
                    name: handle.name().to_string(),
                    reason: format!("runtime module does not export {}", abi::symbols::SET_ASSEMBLY_PATH),
                }
            })?;
            set_path(setter, path)?;
            info!("Assembly path set to {:?}", path);
        }

        let runtime_path = self.paths.runtime_assembly_path.clone().or(assembly_path);
        if let Some(path) = &runtime_path {
            match handle.symbol(abi::symbols::SET_RUNTIME_ASSEMBLY_PATH) {
                Some(setter) => {
                    set_path(setter, path)?;
                    info!("Runtime assembly path set to {:?}", path);
                }
                None => warn!(
                    "{} does not export {}, keeping the runtime default",
                    handle.name(),
                    abi::symbols::SET_RUNTIME_ASSEMBLY_PATH
                ),
            }
        }
        Ok(())
    }
}

fn failure_reason(e: &BridgeError) -> String {
    match e {
        BridgeError::LoadFailed { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

fn set_path(setter: *const c_void, path: &Path) -> Result<()> {
    let path = path
        .to_str()
        .ok_or_else(|| BridgeError::Marshal(format!("path {:?} is not valid UTF-8", path)))?;
    let path = CString::new(path)
        .map_err(|_| BridgeError::Marshal("path contains an interior NUL byte".into()))?;
    // SAFETY: both path setters share the SetAssemblyPathFn signature; the
    // runtime copies the string before returning.
    unsafe {
        let setter = std::mem::transmute::<*const c_void, SetAssemblyPathFn>(setter);
        setter(path.as_ptr());
    }
    Ok(())
}
