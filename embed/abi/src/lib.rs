//! Native ABI of the embedding runtime, revision 4.
//!
//! Everything in here is shared byte-for-byte with the native side. Field
//! order and discriminant values are part of the contract; reordering any of
//! them breaks binary compatibility without a compile error on either side.

mod decimal;
pub use decimal::{Decimal, ParseDecimalError};

use std::ffi::{c_char, c_void};

/// The single ABI revision this workspace speaks. No forward compatibility.
pub const ABI_REVISION: u32 = 4;

/// Exported symbol names of the runtime module.
pub mod symbols {
    pub const SET_ASSEMBLY_PATH: &str = "mono_embeddinator_set_assembly_path";
    pub const SET_RUNTIME_ASSEMBLY_PATH: &str = "mono_embeddinator_set_runtime_assembly_path";
    pub const INSTALL_ERROR_REPORT_HOOK: &str = "mono_embeddinator_install_error_report_hook";
    pub const STRING_FREE: &str = "mono_embeddinator_string_free";
}

pub const MONO_EMBEDDINATOR_OK: i32 = 0;
pub const MONO_EMBEDDINATOR_EXCEPTION_THROWN: i32 = 1;
pub const MONO_EMBEDDINATOR_ASSEMBLY_OPEN_FAILED: i32 = 2;
pub const MONO_EMBEDDINATOR_METHOD_LOOKUP_FAILED: i32 = 3;
pub const MONO_EMBEDDINATOR_CLASS_LOOKUP_FAILED: i32 = 4;

/// Kind of fault reported through the error hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    Ok = MONO_EMBEDDINATOR_OK,
    ExceptionThrown = MONO_EMBEDDINATOR_EXCEPTION_THROWN,
    AssemblyOpenFailed = MONO_EMBEDDINATOR_ASSEMBLY_OPEN_FAILED,
    MethodLookupFailed = MONO_EMBEDDINATOR_METHOD_LOOKUP_FAILED,
    ClassLookupFailed = MONO_EMBEDDINATOR_CLASS_LOOKUP_FAILED,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for ErrorKind {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            MONO_EMBEDDINATOR_OK => Ok(Self::Ok),
            MONO_EMBEDDINATOR_EXCEPTION_THROWN => Ok(Self::ExceptionThrown),
            MONO_EMBEDDINATOR_ASSEMBLY_OPEN_FAILED => Ok(Self::AssemblyOpenFailed),
            MONO_EMBEDDINATOR_METHOD_LOOKUP_FAILED => Ok(Self::MethodLookupFailed),
            MONO_EMBEDDINATOR_CLASS_LOOKUP_FAILED => Ok(Self::ClassLookupFailed),
            other => Err(other),
        }
    }
}

/// Error descriptor handed to the report hook.
///
/// `kind` stays a raw integer so an unknown value coming from a newer runtime
/// is never undefined behaviour on our side. `string` is borrowed for the
/// duration of the hook call only.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeError {
    pub kind: i32,
    /// Managed exception object when `kind` is `EXCEPTION_THROWN`.
    pub exception: *mut c_void,
    pub string: *const c_char,
}

impl NativeError {
    pub fn new(kind: ErrorKind, exception: *mut c_void, string: *const c_char) -> Self {
        Self {
            kind: kind.code(),
            exception,
            string,
        }
    }
}

pub type ErrorReportHook = extern "C" fn(error: NativeError);

// void mono_embeddinator_set_assembly_path(const char* path)
pub type SetAssemblyPathFn = unsafe extern "C" fn(path: *const c_char);

// void* mono_embeddinator_install_error_report_hook(hook) -> previous hook
pub type InstallErrorReportHookFn =
    unsafe extern "C" fn(hook: Option<ErrorReportHook>) -> *mut c_void;

pub type StringFreeFn = unsafe extern "C" fn(string: *mut c_char);

/// Entry point of one exported managed member.
///
/// `args[i]` points at the storage of argument `i`. By-value arguments point
/// at a scratch copy, by-ref and out arguments at the slot the caller reads
/// back after return. `ret` points at storage sized for the return type.
pub type InvokeFn = unsafe extern "C" fn(args: *mut *mut c_void, argc: u32, ret: *mut c_void);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn error_kind_codes_are_stable() {
        for code in 0..5 {
            let kind = ErrorKind::try_from(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(ErrorKind::try_from(5), Err(5));
        assert_eq!(ErrorKind::try_from(-1), Err(-1));
    }

    #[test]
    fn native_error_layout() {
        let ptr = size_of::<*const c_void>();
        assert_eq!(size_of::<NativeError>(), 3 * ptr);
        assert_eq!(align_of::<NativeError>(), ptr);
    }
}
