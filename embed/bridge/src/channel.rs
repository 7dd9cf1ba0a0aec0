//! Fault channel between the runtime and host code.
//!
//! The runtime reports managed faults by calling the installed hook
//! synchronously on the faulting thread. The hook parks the fault in a
//! thread-local slot and returns; nothing unwinds through the native frame.
//! Host code checks and clears the slot right after every native call.

use crate::registry::LibraryHandle;
use crate::{BridgeError, Result};
use abi::{ErrorKind, InstallErrorReportHookFn, NativeError};
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use std::cell::RefCell;
use std::ffi::{c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Opaque reference to a native/managed object. Never dereferenced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeObject(usize);

impl NativeObject {
    pub fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        (!ptr.is_null()).then_some(Self(ptr as usize))
    }

    pub fn addr(&self) -> usize {
        self.0
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

/// A fault reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    /// The managed exception object, for `ExceptionThrown`.
    pub exception: Option<NativeObject>,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            exception: None,
            message: message.into(),
        }
    }

    /// `None` for `ErrorKind::Ok`, which is not a fault.
    pub fn into_error(self) -> Option<BridgeError> {
        let err = match self.kind {
            ErrorKind::Ok => return None,
            ErrorKind::ExceptionThrown => BridgeError::ManagedExceptionThrown(self),
            ErrorKind::AssemblyOpenFailed => BridgeError::AssemblyOpenFailed(self),
            ErrorKind::ClassLookupFailed => BridgeError::ClassLookupFailed(self),
            ErrorKind::MethodLookupFailed => BridgeError::MethodLookupFailed(self),
        };
        Some(err)
    }

    fn from_native(error: &NativeError) -> Option<Self> {
        let kind = match ErrorKind::try_from(error.kind) {
            Ok(ErrorKind::Ok) => return None,
            Ok(kind) => kind,
            Err(code) => {
                warn!("Runtime reported unknown error kind {}", code);
                ErrorKind::ExceptionThrown
            }
        };

        let message = if error.string.is_null() {
            default_message(kind).to_string()
        } else {
            // SAFETY: the runtime keeps `string` alive for the duration of the hook call.
            unsafe { CStr::from_ptr(error.string) }
                .to_string_lossy()
                .into_owned()
        };

        let exception = match kind {
            ErrorKind::ExceptionThrown => NativeObject::from_ptr(error.exception),
            _ => None,
        };

        Some(Self {
            kind,
            exception,
            message,
        })
    }
}

fn default_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Ok => "ok",
        ErrorKind::ExceptionThrown => "managed exception",
        ErrorKind::AssemblyOpenFailed => "assembly could not be opened",
        ErrorKind::ClassLookupFailed => "class not found",
        ErrorKind::MethodLookupFailed => "method not found",
    }
}

thread_local! {
    static FAULT: RefCell<Option<ErrorRecord>> = const { RefCell::new(None) };
}

/// Error report hook handed to the runtime.
///
/// Runs on the faulting thread. `MONO_EMBEDDINATOR_OK` leaves the slot alone.
/// If a fault is already parked for the current call the first one is kept.
pub extern "C" fn report_error(error: NativeError) {
    // unwinding into the runtime is not an option
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(record) = ErrorRecord::from_native(&error) else {
            return;
        };
        debug!("Fault reported: {:?} {}", record.kind, record.message);
        FAULT.with(|slot| match slot.try_borrow_mut() {
            Ok(mut slot) => {
                if slot.is_none() {
                    *slot = Some(record);
                } else {
                    debug!("Fault already pending on this thread, dropping {:?}", record.kind);
                }
            }
            Err(_) => warn!("Fault slot busy, dropping {:?}", record.kind),
        });
    }));
}

#[derive(Debug, Default)]
struct ChannelState {
    installed_into: OnceCell<String>,
}

/// Handle to the fault channel of one bridge context.
#[derive(Debug, Clone, Default)]
pub struct ErrorChannel {
    state: Arc<ChannelState>,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install [`report_error`] into `library`. Only the first call does
    /// anything; later calls return the name of the library it went into.
    pub fn install(&self, library: &LibraryHandle) -> Result<&str> {
        let name = self.state.installed_into.get_or_try_init(|| {
            let symbol = abi::symbols::INSTALL_ERROR_REPORT_HOOK;
            let install = library.symbol(symbol).ok_or_else(|| BridgeError::LoadFailed {
                name: library.name().to_string(),
                reason: format!("runtime module does not export {}", symbol),
            })?;
            // SAFETY: the symbol has the InstallErrorReportHookFn signature under ABI revision 4.
            let install: InstallErrorReportHookFn = unsafe { std::mem::transmute(install) };
            let previous = unsafe { install(Some(report_error)) };
            if !previous.is_null() {
                debug!("Replaced a previously installed error report hook");
            }
            info!("Installed error report hook into {}", library.name());
            Ok::<_, BridgeError>(library.name().to_string())
        })?;
        Ok(name.as_str())
    }

    pub fn is_installed(&self) -> bool {
        self.state.installed_into.get().is_some()
    }

    /// Check-and-clear the current thread's fault slot.
    pub fn take(&self) -> Option<ErrorRecord> {
        FAULT.with(|slot| slot.borrow_mut().take())
    }

    /// Check-and-clear, as a `Result`.
    pub fn check(&self) -> Result<()> {
        match self.take().and_then(ErrorRecord::into_error) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_pending(&self) -> bool {
        FAULT.with(|slot| slot.borrow().is_some())
    }

    /// Drop a fault left behind by an earlier unchecked call so it is not
    /// blamed on the next one.
    pub(crate) fn discard_stale(&self) {
        if let Some(stale) = self.take() {
            warn!(
                "Discarding unchecked fault from an earlier call: {:?} {}",
                stale.kind, stale.message
            );
        }
    }
}
