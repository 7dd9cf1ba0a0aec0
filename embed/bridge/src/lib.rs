//! Host side of the native/managed embedding bridge.
//!
//! A [`BridgeContext`] owns everything: the library registry, the error
//! channel installed into the runtime module, and the call marshaler. The
//! application entry point creates one and passes it to every call site.

mod assets;
mod cell;
mod channel;
mod config;
mod context;
mod marshal;
mod platform;
mod registry;
mod value;

pub use assets::{extract_asset, AssetProvider, DirectoryAssets, EmbeddedAssets};
pub use cell::{CellSlot, Out, Ref, ReferenceCell};
pub use channel::{report_error, ErrorChannel, ErrorRecord, NativeObject};
pub use config::{load_config, BridgeConfig, StringOwnership};
pub use context::BridgeContext;
pub use marshal::{Arg, CallDescriptor, Marshaler, MethodId, Param, PassMode, Signature};
pub use platform::{
    BundledLoader, DesktopLoader, DynamicModule, NativeModule, Platform, PlatformLoader,
    StaticLoader, StaticModule,
};
pub use registry::{Initializer, LibraryHandle, LoadState, Registry, RuntimePaths};
pub use value::{Field, Marshal, StructLayout, Value, ValueType};

pub use abi::{Decimal, ErrorKind};

use std::path::PathBuf;

/// Errors raised by the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Library not found: {name} (searched {searched:?})")]
    LibraryNotFound { name: String, searched: Vec<PathBuf> },
    #[error("Failed to load library {name}: {reason}")]
    LoadFailed { name: String, reason: String },
    #[error("Managed exception thrown: {}", .0.message)]
    ManagedExceptionThrown(ErrorRecord),
    #[error("Failed to open assembly: {}", .0.message)]
    AssemblyOpenFailed(ErrorRecord),
    #[error("Class lookup failed: {}", .0.message)]
    ClassLookupFailed(ErrorRecord),
    #[error("Method lookup failed: {}", .0.message)]
    MethodLookupFailed(ErrorRecord),
    #[error("Contract violation: {0}")]
    ContractViolation(String),
    #[error("Marshaling error: {0}")]
    Marshal(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// The fault record reported by the runtime, for call-time errors.
    pub fn record(&self) -> Option<&ErrorRecord> {
        match self {
            Self::ManagedExceptionThrown(r)
            | Self::AssemblyOpenFailed(r)
            | Self::ClassLookupFailed(r)
            | Self::MethodLookupFailed(r) => Some(r),
            _ => None,
        }
    }

    /// ABI error code for runtime-reported faults.
    pub fn code(&self) -> Option<i32> {
        self.record().map(|r| r.kind.code())
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
