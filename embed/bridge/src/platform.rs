//! Platform capability: finding, loading and unpacking native modules.
//!
//! One [`PlatformLoader`] is picked at startup and handed to the registry.
//! Desktop builds search the filesystem; mobile builds unpack bundled
//! assemblies first; [`StaticLoader`] serves modules linked into the process.

use crate::assets::{extract_asset, AssetProvider};
use crate::{BridgeError, Result};
use libloading::Library;
use log::{debug, info};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Apple,
    /// Linux, Android and other ELF targets.
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else if cfg!(target_vendor = "apple") {
            Self::Apple
        } else {
            Self::Unix
        }
    }

    pub fn library_file_name(&self, name: &str) -> String {
        match self {
            Self::Windows => format!("{}.dll", name),
            Self::Apple => format!("lib{}.dylib", name),
            Self::Unix => format!("lib{}.so", name),
        }
    }
}

/// A loaded module's exported symbols.
pub trait NativeModule: Send + Sync {
    fn symbol(&self, name: &str) -> Option<*const c_void>;
}

/// Module opened through the OS loader.
pub struct DynamicModule {
    library: Library,
}

impl DynamicModule {
    pub fn open(path: &Path) -> Result<Self, libloading::Error> {
        // SAFETY: running the module's initialisers is the point of loading it.
        let library = unsafe { Library::new(path) }?;
        Ok(Self { library })
    }
}

impl NativeModule for DynamicModule {
    fn symbol(&self, name: &str) -> Option<*const c_void> {
        // SAFETY: only the address is taken here; callers cast it to the ABI signature.
        unsafe { self.library.get::<*const c_void>(name.as_bytes()) }
            .ok()
            .map(|symbol| *symbol)
    }
}

/// Symbol table of code linked into the process.
#[derive(Debug, Clone, Default)]
pub struct StaticModule {
    symbols: HashMap<String, usize>,
}

impl StaticModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symbol(mut self, name: impl Into<String>, address: *const c_void) -> Self {
        self.symbols.insert(name.into(), address as usize);
        self
    }

    pub fn with_symbols<'a>(mut self, symbols: impl IntoIterator<Item = (&'a str, *const c_void)>) -> Self {
        for (name, address) in symbols {
            self.symbols.insert(name.to_string(), address as usize);
        }
        self
    }
}

impl NativeModule for StaticModule {
    fn symbol(&self, name: &str) -> Option<*const c_void> {
        self.symbols.get(name).map(|&address| address as *const c_void)
    }
}

pub trait PlatformLoader: Send + Sync {
    /// Map a logical library name to a loadable path.
    fn resolve_library(&self, name: &str) -> Result<PathBuf>;

    fn load(&self, path: &Path) -> Result<Box<dyn NativeModule>>;

    /// Unpack the managed assembly for `name` if this platform ships it
    /// bundled. Returns the path the runtime should be pointed at.
    fn extract_resource(&self, _name: &str) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

fn load_failed(path: &Path, reason: impl ToString) -> BridgeError {
    BridgeError::LoadFailed {
        name: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Filesystem search with per-OS naming rules.
#[derive(Debug, Clone)]
pub struct DesktopLoader {
    platform: Platform,
    search_paths: Vec<PathBuf>,
}

impl DesktopLoader {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            platform: Platform::current(),
            search_paths,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Directory of the running executable, then the working directory.
    pub fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
            paths.push(dir);
        }
        if let Ok(cwd) = std::env::current_dir() {
            if !paths.contains(&cwd) {
                paths.push(cwd);
            }
        }
        paths
    }

    pub fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        let as_path = Path::new(name);
        if as_path.components().count() > 1 || as_path.extension().is_some() {
            candidates.push(as_path.to_path_buf());
        }
        let file_name = self.platform.library_file_name(name);
        candidates.extend(self.search_paths.iter().map(|dir| dir.join(&file_name)));
        candidates
    }
}

impl PlatformLoader for DesktopLoader {
    fn resolve_library(&self, name: &str) -> Result<PathBuf> {
        let candidates = self.candidates(name);
        match candidates.iter().find(|path| path.is_file()) {
            Some(path) => {
                debug!("Resolved {} to {:?}", name, path);
                Ok(path.clone())
            }
            None => Err(BridgeError::LibraryNotFound {
                name: name.to_string(),
                searched: candidates,
            }),
        }
    }

    fn load(&self, path: &Path) -> Result<Box<dyn NativeModule>> {
        let module = DynamicModule::open(path).map_err(|e| load_failed(path, e))?;
        Ok(Box::new(module))
    }
}

const RUNTIME_ASSEMBLY_DIR: [&str; 2] = ["mono", "4.5"];

/// Loader for bundles that carry their managed assemblies as assets.
///
/// Assemblies live under `assemblies/<name>.dll` in the bundle and are
/// unpacked into the extraction directory before the library is loaded.
/// Runtime assemblies (e.g. `mscorlib`) go to `<extraction>/mono/4.5`.
pub struct BundledLoader {
    assets: Box<dyn AssetProvider>,
    extraction_dir: PathBuf,
    runtime_assemblies: Vec<String>,
    runtime_extracted: OnceCell<()>,
    native: DesktopLoader,
}

impl BundledLoader {
    pub fn new(assets: Box<dyn AssetProvider>, extraction_dir: PathBuf, native: DesktopLoader) -> Self {
        Self {
            assets,
            extraction_dir,
            runtime_assemblies: Vec::new(),
            runtime_extracted: OnceCell::new(),
            native,
        }
    }

    pub fn with_runtime_assemblies(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.runtime_assemblies = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn asset_path(name: &str) -> String {
        format!("assemblies/{}.dll", name)
    }

    pub fn runtime_assembly_dir(&self) -> PathBuf {
        RUNTIME_ASSEMBLY_DIR
            .iter()
            .fold(self.extraction_dir.clone(), |dir, part| dir.join(part))
    }

    fn extract_runtime_assemblies(&self) -> Result<()> {
        self.runtime_extracted.get_or_try_init(|| {
            let dir = self.runtime_assembly_dir();
            for name in &self.runtime_assemblies {
                extract_asset(self.assets.as_ref(), &Self::asset_path(name), &dir.join(format!("{}.dll", name)))?;
            }
            Ok::<_, BridgeError>(())
        })?;
        Ok(())
    }
}

impl PlatformLoader for BundledLoader {
    fn resolve_library(&self, name: &str) -> Result<PathBuf> {
        self.native.resolve_library(name)
    }

    fn load(&self, path: &Path) -> Result<Box<dyn NativeModule>> {
        self.native.load(path)
    }

    fn extract_resource(&self, name: &str) -> Result<Option<PathBuf>> {
        self.extract_runtime_assemblies()?;
        let target = self.extraction_dir.join(format!("{}.dll", name));
        extract_asset(self.assets.as_ref(), &Self::asset_path(name), &target)?;
        Ok(Some(target))
    }
}

/// Loader over modules registered at startup; no filesystem access.
#[derive(Debug, Clone, Default)]
pub struct StaticLoader {
    modules: HashMap<String, StaticModule>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, module: StaticModule) -> Self {
        let name = name.into();
        info!("Registered static module {}", name);
        self.modules.insert(name, module);
        self
    }
}

impl PlatformLoader for StaticLoader {
    fn resolve_library(&self, name: &str) -> Result<PathBuf> {
        if self.modules.contains_key(name) {
            Ok(PathBuf::from(name))
        } else {
            Err(BridgeError::LibraryNotFound {
                name: name.to_string(),
                searched: Vec::new(),
            })
        }
    }

    fn load(&self, path: &Path) -> Result<Box<dyn NativeModule>> {
        let module = path
            .to_str()
            .and_then(|name| self.modules.get(name))
            .ok_or_else(|| load_failed(path, "no static module registered under this name"))?;
        Ok(Box::new(module.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::EmbeddedAssets;
    use std::fs;

    #[test]
    fn naming_rules() {
        assert_eq!(Platform::Windows.library_file_name("managed"), "managed.dll");
        assert_eq!(Platform::Apple.library_file_name("managed"), "libmanaged.dylib");
        assert_eq!(Platform::Unix.library_file_name("managed"), "libmanaged.so");
    }

    #[test]
    fn desktop_resolves_in_search_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(second.path().join("libmanaged.so"), b"").unwrap();

        let loader = DesktopLoader::new(vec![first.path().into(), second.path().into()])
            .with_platform(Platform::Unix);
        assert_eq!(
            loader.resolve_library("managed").unwrap(),
            second.path().join("libmanaged.so")
        );

        fs::write(first.path().join("libmanaged.so"), b"").unwrap();
        assert_eq!(
            loader.resolve_library("managed").unwrap(),
            first.path().join("libmanaged.so")
        );
    }

    #[test]
    fn desktop_reports_every_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DesktopLoader::new(vec![dir.path().into()]).with_platform(Platform::Windows);
        match loader.resolve_library("missing") {
            Err(BridgeError::LibraryNotFound { name, searched }) => {
                assert_eq!(name, "missing");
                assert_eq!(searched, vec![dir.path().join("missing.dll")]);
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn desktop_rejects_a_file_that_is_not_a_library() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.dll");
        fs::write(&bogus, b"definitely not a shared object").unwrap();

        let loader = DesktopLoader::new(Vec::new());
        let err = loader.load(&bogus).err().unwrap();
        assert!(matches!(err, BridgeError::LoadFailed { .. }));
    }

    #[test]
    fn static_loader_round_trip() {
        let marker = 7u8;
        let module = StaticModule::new().with_symbol("answer", &marker as *const u8 as *const c_void);
        let loader = StaticLoader::new().register("managed", module);

        let path = loader.resolve_library("managed").unwrap();
        let module = loader.load(&path).unwrap();
        assert_eq!(module.symbol("answer"), Some(&marker as *const u8 as *const c_void));
        assert!(module.symbol("question").is_none());
        assert!(loader.resolve_library("other").is_err());
    }

    #[test]
    fn bundled_loader_unpacks_runtime_and_library() {
        let dir = tempfile::tempdir().unwrap();
        let assets = EmbeddedAssets::new()
            .with("assemblies/managed.dll", b"managed".as_slice())
            .with("assemblies/mscorlib.dll", b"corlib".as_slice());
        let loader = BundledLoader::new(Box::new(assets), dir.path().into(), DesktopLoader::new(Vec::new()))
            .with_runtime_assemblies(["mscorlib"]);

        let path = loader.extract_resource("managed").unwrap().unwrap();
        assert_eq!(path, dir.path().join("managed.dll"));
        assert_eq!(fs::read(&path).unwrap(), b"managed");
        assert_eq!(
            fs::read(dir.path().join("mono").join("4.5").join("mscorlib.dll")).unwrap(),
            b"corlib"
        );
        assert!(loader.extract_resource("absent").is_err());
    }
}
