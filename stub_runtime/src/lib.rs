// In-process stand-in for the native embedding runtime. Exports the runtime
// entry points plus a few managed members so the bridge can be exercised
// without a real managed environment.

// member exports are named `Type_Member`
#![allow(non_snake_case)]

use abi::{Decimal, ErrorKind, ErrorReportHook, NativeError};
use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::sync::{Mutex, PoisonError};

static HOOK: Mutex<Option<ErrorReportHook>> = Mutex::new(None);
static ASSEMBLY_PATH: Mutex<Option<String>> = Mutex::new(None);
static RUNTIME_ASSEMBLY_PATH: Mutex<Option<String>> = Mutex::new(None);

/// Stands in for a managed exception object.
static EXCEPTION_OBJECT: u8 = 0;

thread_local! {
    static FAIL_NEXT: Cell<bool> = const { Cell::new(false) };
    static LIVE_STRINGS: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
    static STRINGS_FREED: Cell<usize> = const { Cell::new(0) };
    static INVALID_FREES: Cell<usize> = const { Cell::new(0) };
}

fn read_path(path: *const c_char) -> Option<String> {
    if path.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(path) }.to_string_lossy().into_owned())
}

#[no_mangle]
pub extern "C" fn mono_embeddinator_set_assembly_path(path: *const c_char) {
    let path = read_path(path);
    debug!("Assembly path: {:?}", path);
    *ASSEMBLY_PATH.lock().unwrap_or_else(PoisonError::into_inner) = path;
}

#[no_mangle]
pub extern "C" fn mono_embeddinator_set_runtime_assembly_path(path: *const c_char) {
    let path = read_path(path);
    debug!("Runtime assembly path: {:?}", path);
    *RUNTIME_ASSEMBLY_PATH.lock().unwrap_or_else(PoisonError::into_inner) = path;
}

#[no_mangle]
pub extern "C" fn mono_embeddinator_install_error_report_hook(hook: Option<ErrorReportHook>) -> *mut c_void {
    let previous = std::mem::replace(&mut *HOOK.lock().unwrap_or_else(PoisonError::into_inner), hook);
    previous.map_or(ptr::null_mut(), |hook| hook as *mut c_void)
}

#[no_mangle]
pub unsafe extern "C" fn mono_embeddinator_string_free(string: *mut c_char) {
    if string.is_null() {
        return;
    }
    let known = LIVE_STRINGS.with(|live| live.borrow_mut().remove(&(string as usize)));
    if known {
        drop(CString::from_raw(string));
        STRINGS_FREED.with(|n| n.set(n.get() + 1));
    } else {
        warn!("Free of a string this runtime did not hand out: {:p}", string);
        INVALID_FREES.with(|n| n.set(n.get() + 1));
    }
}

fn raise(kind: ErrorKind, message: &str) {
    let hook = *HOOK.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(hook) = hook else {
        warn!("No error report hook installed, dropping {:?}: {}", kind, message);
        return;
    };
    let exception = match kind {
        ErrorKind::ExceptionThrown => &EXCEPTION_OBJECT as *const u8 as *mut c_void,
        _ => ptr::null_mut(),
    };
    let message = CString::new(message).unwrap_or_default();
    hook(NativeError::new(kind, exception, message.as_ptr()));
}

/// Allocate a string the caller is expected to release.
fn alloc_string(s: &str) -> *mut c_char {
    let ptr = CString::new(s).unwrap_or_default().into_raw();
    LIVE_STRINGS.with(|live| live.borrow_mut().insert(ptr as usize));
    ptr
}

unsafe fn arg<T>(args: *mut *mut c_void, index: usize) -> *mut T {
    (*args.add(index)).cast()
}

unsafe fn string_arg(args: *mut *mut c_void, index: usize) -> Option<String> {
    read_path(*arg::<*const c_char>(args, index))
}

// Tests.Answer() -> int
#[no_mangle]
pub unsafe extern "C" fn Tests_Answer(_args: *mut *mut c_void, _argc: u32, ret: *mut c_void) {
    if FAIL_NEXT.with(|fail| fail.replace(false)) {
        raise(
            ErrorKind::ExceptionThrown,
            "System.InvalidOperationException: the answer is not available",
        );
        return;
    }
    *ret.cast::<i32>() = 42;
}

// Parameters.Ref(ref bool b, ref string s)
#[no_mangle]
pub unsafe extern "C" fn Parameters_Ref(args: *mut *mut c_void, _argc: u32, _ret: *mut c_void) {
    let b = arg::<bool>(args, 0);
    *b = !*b;

    let s = arg::<*mut c_char>(args, 1);
    *s = if (*s).is_null() {
        alloc_string("hello")
    } else {
        ptr::null_mut()
    };
}

// Parameters.Out(string s, out int length, out string upper)
#[no_mangle]
pub unsafe extern "C" fn Parameters_Out(args: *mut *mut c_void, _argc: u32, _ret: *mut c_void) {
    let length = arg::<i32>(args, 1);
    let upper = arg::<*mut c_char>(args, 2);
    match string_arg(args, 0) {
        Some(s) => {
            *length = s.chars().count() as i32;
            *upper = alloc_string(&s.to_uppercase());
        }
        None => {
            *length = 0;
            *upper = ptr::null_mut();
        }
    }
}

// Parameters.OutNoWrite(out int value, out string text): assigns nothing.
#[no_mangle]
pub unsafe extern "C" fn Parameters_OutNoWrite(_args: *mut *mut c_void, _argc: u32, _ret: *mut c_void) {}

// Parameters.Echo(ref string s): leaves the caller's string in place.
#[no_mangle]
pub unsafe extern "C" fn Parameters_Echo(_args: *mut *mut c_void, _argc: u32, _ret: *mut c_void) {}

// Parameters.Concat(string a, string b) -> string
#[no_mangle]
pub unsafe extern "C" fn Parameters_Concat(args: *mut *mut c_void, _argc: u32, ret: *mut c_void) {
    let a = string_arg(args, 0).unwrap_or_default();
    let b = string_arg(args, 1).unwrap_or_default();
    *ret.cast::<*mut c_char>() = alloc_string(&(a + &b));
}

// Parameters.RefUnsignedCharPlusOne(ref byte b)
#[no_mangle]
pub unsafe extern "C" fn Parameters_RefUnsignedCharPlusOne(args: *mut *mut c_void, _argc: u32, _ret: *mut c_void) {
    let b = arg::<u8>(args, 0);
    *b = (*b).wrapping_add(1);
}

// Decimals.Negate(decimal d) -> decimal
#[no_mangle]
pub unsafe extern "C" fn Decimals_Negate(args: *mut *mut c_void, _argc: u32, ret: *mut c_void) {
    let mut d = ptr::read_unaligned(arg::<Decimal>(args, 0));
    d.sign_scale ^= 1 << 31;
    ptr::write_unaligned(ret.cast::<Decimal>(), d);
}

// Exceptions.Throw(out int progress): assigns, then throws.
#[no_mangle]
pub unsafe extern "C" fn Exceptions_Throw(args: *mut *mut c_void, _argc: u32, ret: *mut c_void) {
    *arg::<i32>(args, 0) = 7;
    *ret.cast::<i32>() = 7;
    raise(ErrorKind::ExceptionThrown, "System.Exception: thrown on purpose");
}

// Exceptions.MissingClass(): the runtime cannot find the declaring class.
#[no_mangle]
pub unsafe extern "C" fn Exceptions_MissingClass(_args: *mut *mut c_void, _argc: u32, _ret: *mut c_void) {
    raise(ErrorKind::ClassLookupFailed, "Exceptions.Gone");
}

// Exceptions.MissingAssembly(): the runtime cannot open the assembly.
#[no_mangle]
pub unsafe extern "C" fn Exceptions_MissingAssembly(_args: *mut *mut c_void, _argc: u32, _ret: *mut c_void) {
    raise(ErrorKind::AssemblyOpenFailed, "gone.dll");
}

// Exceptions.ReportOk() -> int: reports OK, which is not a fault.
#[no_mangle]
pub unsafe extern "C" fn Exceptions_ReportOk(_args: *mut *mut c_void, _argc: u32, ret: *mut c_void) {
    raise(ErrorKind::Ok, "nothing happened");
    *ret.cast::<i32>() = 1;
}

/// Every exported symbol, for registering the runtime with an in-process loader.
pub fn exports() -> Vec<(&'static str, *const c_void)> {
    vec![
        (abi::symbols::SET_ASSEMBLY_PATH, mono_embeddinator_set_assembly_path as *const c_void),
        (
            abi::symbols::SET_RUNTIME_ASSEMBLY_PATH,
            mono_embeddinator_set_runtime_assembly_path as *const c_void,
        ),
        (
            abi::symbols::INSTALL_ERROR_REPORT_HOOK,
            mono_embeddinator_install_error_report_hook as *const c_void,
        ),
        (abi::symbols::STRING_FREE, mono_embeddinator_string_free as *const c_void),
        ("Tests_Answer", Tests_Answer as *const c_void),
        ("Parameters_Ref", Parameters_Ref as *const c_void),
        ("Parameters_Out", Parameters_Out as *const c_void),
        ("Parameters_OutNoWrite", Parameters_OutNoWrite as *const c_void),
        ("Parameters_Echo", Parameters_Echo as *const c_void),
        ("Parameters_Concat", Parameters_Concat as *const c_void),
        (
            "Parameters_RefUnsignedCharPlusOne",
            Parameters_RefUnsignedCharPlusOne as *const c_void,
        ),
        ("Decimals_Negate", Decimals_Negate as *const c_void),
        ("Exceptions_Throw", Exceptions_Throw as *const c_void),
        ("Exceptions_MissingClass", Exceptions_MissingClass as *const c_void),
        ("Exceptions_MissingAssembly", Exceptions_MissingAssembly as *const c_void),
        ("Exceptions_ReportOk", Exceptions_ReportOk as *const c_void),
    ]
}

/// Make the next `Tests_Answer` on this thread throw.
pub fn fail_next_call() {
    FAIL_NEXT.with(|fail| fail.set(true));
}

/// Strings released through `mono_embeddinator_string_free` on this thread.
pub fn strings_freed() -> usize {
    STRINGS_FREED.with(Cell::get)
}

/// Strings handed out on this thread and not released yet.
pub fn live_strings() -> usize {
    LIVE_STRINGS.with(|live| live.borrow().len())
}

/// Frees of pointers that were never handed out, or were already released.
pub fn invalid_frees() -> usize {
    INVALID_FREES.with(Cell::get)
}

pub fn assembly_path() -> Option<String> {
    ASSEMBLY_PATH.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

pub fn runtime_assembly_path() -> Option<String> {
    RUNTIME_ASSEMBLY_PATH
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub fn hook_installed() -> bool {
    HOOK.lock().unwrap_or_else(PoisonError::into_inner).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_free_rejects_unknown_and_double_frees() {
        let s = alloc_string("x");
        assert_eq!(live_strings(), 1);
        unsafe {
            mono_embeddinator_string_free(s);
            mono_embeddinator_string_free(s);
        }
        assert_eq!(strings_freed(), 1);
        assert_eq!(invalid_frees(), 1);
        assert_eq!(live_strings(), 0);
    }

    #[test]
    fn decimal_negate_flips_the_sign_bit() {
        let mut input = Decimal::from_parts(12345, 2, false).unwrap();
        let mut output = Decimal::ZERO;
        let mut args = [&mut input as *mut Decimal as *mut c_void];
        unsafe { Decimals_Negate(args.as_mut_ptr(), 1, &mut output as *mut Decimal as *mut c_void) };
        assert_eq!(output.to_string(), "-123.45");
    }
}
