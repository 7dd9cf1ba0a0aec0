use crate::{BridgeError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Who releases strings the native side hands back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum StringOwnership {
    /// The runtime keeps ownership; the bridge copies and forgets.
    #[default]
    Native,
    /// The caller owns the buffer and releases it through the runtime's free
    /// function.
    Transferred,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Must equal the one ABI revision this build speaks.
    #[serde(default = "default_abi_revision")]
    pub abi_revision: u32,

    /// Directories searched for native libraries, in order. Empty means the
    /// executable's directory, then the working directory.
    pub library_search_paths: Vec<PathBuf>,

    /// Directory the runtime searches for managed assemblies.
    pub assembly_path: Option<PathBuf>,
    /// Directory holding the runtime's own assemblies (mscorlib and friends).
    pub runtime_assembly_path: Option<PathBuf>,

    /// Root of a bundle carrying `assemblies/<name>.dll`. When set, managed
    /// assemblies are unpacked from it before their library is loaded.
    pub asset_dir: Option<PathBuf>,
    /// Where bundled assemblies are unpacked. Defaults to a directory under
    /// the system temp dir.
    pub extraction_dir: Option<PathBuf>,
    /// Runtime assemblies to unpack alongside, e.g. `mscorlib`.
    pub runtime_assemblies: Vec<String>,

    /// Default for members whose descriptor says nothing about strings.
    pub strings_transferred: bool,
}

fn default_abi_revision() -> u32 {
    abi::ABI_REVISION
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            abi_revision: default_abi_revision(),
            library_search_paths: Vec::new(),
            assembly_path: None,
            runtime_assembly_path: None,
            asset_dir: None,
            extraction_dir: None,
            runtime_assemblies: Vec::new(),
            strings_transferred: false,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.abi_revision != abi::ABI_REVISION {
            return Err(BridgeError::Config(format!(
                "ABI revision {} requested, this build speaks revision {}",
                self.abi_revision,
                abi::ABI_REVISION
            )));
        }
        Ok(())
    }

    pub fn string_ownership(&self) -> StringOwnership {
        if self.strings_transferred {
            StringOwnership::Transferred
        } else {
            StringOwnership::Native
        }
    }

    pub fn extraction_dir(&self) -> PathBuf {
        self.extraction_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("embed-bridge"))
    }
}

/// Read `path`, or write the defaults there if it does not exist yet.
pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    let config = if path.exists() {
        info!("Loading config from {:?}", path);
        let reader = BufReader::new(fs::File::open(path)?);
        serde_json::from_reader(reader)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?
    } else {
        info!("Config not found. Creating default at {:?}", path);
        let config = BridgeConfig::default();
        let writer = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer_pretty(writer, &config)
            .map_err(|e| BridgeError::Config(e.to_string()))?;
        config
    };
    config.validate()?;
    Ok(config)
}
