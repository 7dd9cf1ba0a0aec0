//! Managed assemblies shipped inside an application bundle.

use crate::{BridgeError, Result};
use log::info;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

/// Source of bundled bytes. Each opened stream is read once, front to back.
pub trait AssetProvider: Send + Sync {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + '_>>;
}

/// Assets laid out under a directory (unpacked bundle, jar-style resource root).
#[derive(Debug, Clone)]
pub struct DirectoryAssets {
    root: PathBuf,
}

impl DirectoryAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetProvider for DirectoryAssets {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + '_>> {
        let file = File::open(self.root.join(path))?;
        Ok(Box::new(file))
    }
}

/// Assets compiled into the binary.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedAssets {
    entries: HashMap<String, Cow<'static, [u8]>>,
}

impl EmbeddedAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, bytes: impl Into<Cow<'static, [u8]>>) -> Self {
        self.entries.insert(path.into(), bytes.into());
        self
    }
}

impl AssetProvider for EmbeddedAssets {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + '_>> {
        let bytes = self
            .entries
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
        Ok(Box::new(Cursor::new(bytes.as_ref())))
    }
}

/// Copy `asset` to `target`. The file only appears at `target` once the whole
/// stream has been written and synced, so nothing can pick up a partial
/// assembly.
pub fn extract_asset(provider: &dyn AssetProvider, asset: &str, target: &Path) -> Result<u64> {
    let mut input = provider.open(asset).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => BridgeError::LibraryNotFound {
            name: asset.to_string(),
            searched: vec![PathBuf::from(asset)],
        },
        _ => BridgeError::Io(e),
    })?;

    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let partial = target.with_extension("partial");
    let mut copy = || -> io::Result<u64> {
        let mut writer = BufWriter::new(File::create(&partial)?);
        let written = io::copy(&mut input, &mut writer)?;
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(written)
    };

    let written = match copy() {
        Ok(written) => written,
        Err(e) => {
            let _ = fs::remove_file(&partial);
            return Err(e.into());
        }
    };
    fs::rename(&partial, target)?;

    info!("Extracted {} ({} bytes) to {:?}", asset, written, target);
    Ok(written)
}
