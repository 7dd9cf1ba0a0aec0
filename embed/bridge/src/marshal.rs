//! Cross-boundary calls.
//!
//! Every argument gets its own zero-initialised, 8-byte aligned slot. The
//! native entry point receives an array of pointers to those slots plus a
//! pointer to the return slot, and reads or writes them in place. By-ref and
//! out slots are decoded back into their cells only when the call finished
//! without a fault.

use crate::cell::{CellSlot, Out, Ref};
use crate::channel::ErrorChannel;
use crate::config::StringOwnership;
use crate::registry::LibraryHandle;
use crate::value::{read_value, write_value, Marshal, StringArena, Value, ValueType};
use crate::{BridgeError, Result};
use log::{debug, trace, warn};
use std::ffi::{c_char, c_void};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassMode {
    ByValue,
    ByRef,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Param {
    pub name: String,
    pub ty: ValueType,
    pub mode: PassMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<Param>,
    pub ret: ValueType,
}

impl Default for Signature {
    fn default() -> Self {
        Self {
            params: Vec::new(),
            ret: ValueType::Unit,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", param.ty)?;
            if param.mode != PassMode::ByValue {
                f.write_str("&")?;
            }
        }
        f.write_str(")")
    }
}

/// Managed method identity, displayed the way the runtime's method
/// descriptions read: `Type:Member(int,string&)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodId {
    pub declaring_type: String,
    pub member: String,
    pub signature: Signature,
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.declaring_type, self.member, self.signature)
    }
}

/// Everything needed to make one call: which member, its parameter modes,
/// and who owns strings coming back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    method: MethodId,
    entry_point: String,
    strings: Option<StringOwnership>,
}

impl CallDescriptor {
    /// The entry point defaults to `Type_Member`, with dots in namespaced
    /// type names replaced by underscores.
    pub fn new(declaring_type: impl Into<String>, member: impl Into<String>) -> Self {
        let declaring_type = declaring_type.into();
        let member = member.into();
        let entry_point = format!("{}_{}", declaring_type, member).replace('.', "_");
        Self {
            method: MethodId {
                declaring_type,
                member,
                signature: Signature::default(),
            },
            entry_point,
            strings: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, ty: ValueType, mode: PassMode) -> Self {
        self.method.signature.params.push(Param {
            name: name.into(),
            ty,
            mode,
        });
        self
    }

    pub fn by_value<T: Marshal>(self, name: impl Into<String>) -> Self {
        self.param(name, T::value_type(), PassMode::ByValue)
    }

    pub fn by_ref<T: Marshal>(self, name: impl Into<String>) -> Self {
        self.param(name, T::value_type(), PassMode::ByRef)
    }

    pub fn out<T: Marshal>(self, name: impl Into<String>) -> Self {
        self.param(name, T::value_type(), PassMode::Out)
    }

    pub fn returns<T: Marshal>(self) -> Self {
        self.returns_type(T::value_type())
    }

    pub fn returns_type(mut self, ty: ValueType) -> Self {
        self.method.signature.ret = ty;
        self
    }

    /// Override the exported symbol, e.g. for overloads.
    pub fn entry_point(mut self, symbol: impl Into<String>) -> Self {
        self.entry_point = symbol.into();
        self
    }

    /// Strings returned by this member are allocated for the caller, who
    /// releases them.
    pub fn transfer_strings(mut self) -> Self {
        self.strings = Some(StringOwnership::Transferred);
        self
    }

    pub fn native_strings(mut self) -> Self {
        self.strings = Some(StringOwnership::Native);
        self
    }

    pub fn method(&self) -> &MethodId {
        &self.method
    }

    pub fn symbol(&self) -> &str {
        &self.entry_point
    }

    pub fn string_ownership(&self) -> Option<StringOwnership> {
        self.strings
    }
}

/// One actual argument.
pub enum Arg<'a> {
    Value(Value),
    Ref(&'a mut dyn CellSlot),
    Out(&'a mut dyn CellSlot),
}

impl<'a> Arg<'a> {
    pub fn value(value: impl Marshal) -> Self {
        Self::Value(value.into_value())
    }

    fn mode(&self) -> PassMode {
        match self {
            Self::Value(_) => PassMode::ByValue,
            Self::Ref(_) => PassMode::ByRef,
            Self::Out(_) => PassMode::Out,
        }
    }
}

impl fmt::Debug for Arg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Ref(slot) => f.debug_tuple("Ref").field(&slot.value_type()).finish(),
            Self::Out(slot) => f.debug_tuple("Out").field(&slot.value_type()).finish(),
        }
    }
}

impl<'a, T: Marshal + Clone + 'a> From<Ref<'a, T>> for Arg<'a> {
    fn from(view: Ref<'a, T>) -> Self {
        Self::Ref(view.cell)
    }
}

impl<'a, T: Marshal + Clone + 'a> From<Out<'a, T>> for Arg<'a> {
    fn from(view: Out<'a, T>) -> Self {
        Self::Out(view.cell)
    }
}

/// Storage for one argument or the return value.
struct Slot {
    words: Vec<u64>,
    size: usize,
}

impl Slot {
    fn new(ty: &ValueType) -> Self {
        let size = ty.size();
        Self {
            words: vec![0; size.div_ceil(8).max(1)],
            size,
        }
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.size]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.size]
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        self.words.as_mut_ptr().cast()
    }
}

/// Issues calls and checks the error channel after each one.
#[derive(Debug, Clone)]
pub struct Marshaler {
    channel: ErrorChannel,
    default_strings: StringOwnership,
}

impl Marshaler {
    pub fn new(channel: ErrorChannel, default_strings: StringOwnership) -> Self {
        Self {
            channel,
            default_strings,
        }
    }

    /// Call `call` in `library`.
    ///
    /// On a fault nothing is written back: cells keep their previous values
    /// and the return value is dropped.
    pub fn invoke(&self, library: &LibraryHandle, call: &CallDescriptor, args: &mut [Arg<'_>]) -> Result<Value> {
        let method = call.method();
        let params = &method.signature.params;
        if args.len() != params.len() {
            return Err(BridgeError::Marshal(format!(
                "{} takes {} arguments, got {}",
                method,
                params.len(),
                args.len()
            )));
        }

        let mut arena = StringArena::default();
        let mut slots = Vec::with_capacity(params.len());
        for (param, arg) in params.iter().zip(args.iter()) {
            slots.push(self.encode(method, param, arg, &mut arena)?);
        }
        let mut ret = Slot::new(&method.signature.ret);

        let entry = library.entry_point(call.symbol())?;
        let mut pointers: Vec<*mut c_void> = slots.iter_mut().map(Slot::as_mut_ptr).collect();
        let argc = u32::try_from(pointers.len())
            .map_err(|_| BridgeError::Marshal(format!("{} has too many arguments", method)))?;

        self.channel.discard_stale();
        trace!("Calling {} through {}", method, call.symbol());
        // SAFETY: every pointer refers to a live slot sized for its parameter
        // type, and the entry point follows the InvokeFn convention.
        unsafe { entry(pointers.as_mut_ptr(), argc, ret.as_mut_ptr()) };

        if let Err(e) = self.channel.check() {
            debug!("{} faulted: {}", method, e);
            return Err(e);
        }

        // SAFETY: the call returned without a fault, so string slots hold
        // either null or a NUL-terminated buffer.
        let decoded = unsafe { Self::decode(method, &slots, &ret, &mut arena) };

        let ownership = call.string_ownership().unwrap_or(self.default_strings);
        if ownership == StringOwnership::Transferred {
            Self::release_strings(library, &arena);
        }

        let (value, written) = decoded?;
        // all cells convert or none is written
        for (arg, value) in args.iter().zip(&written) {
            if let (Arg::Ref(slot) | Arg::Out(slot), Some(value)) = (arg, value) {
                slot.check(value)?;
            }
        }
        for (arg, value) in args.iter_mut().zip(written) {
            if let (Arg::Ref(slot) | Arg::Out(slot), Some(value)) = (arg, value) {
                slot.store(value)?;
            }
        }
        Ok(value)
    }

    fn encode(&self, method: &MethodId, param: &Param, arg: &Arg<'_>, arena: &mut StringArena) -> Result<Slot> {
        if arg.mode() != param.mode {
            return Err(BridgeError::Marshal(format!(
                "{}: parameter {} is {:?}, argument is {:?}",
                method,
                param.name,
                param.mode,
                arg.mode()
            )));
        }

        let mut slot = Slot::new(&param.ty);
        match arg {
            Arg::Value(value) => write_value(&param.ty, value, slot.bytes_mut(), arena)
                .map_err(|e| annotate(method, param, e))?,
            Arg::Ref(cell) | Arg::Out(cell) if cell.value_type() != param.ty => {
                return Err(BridgeError::Marshal(format!(
                    "{}: parameter {} expects {}, cell holds {}",
                    method,
                    param.name,
                    param.ty,
                    cell.value_type()
                )));
            }
            Arg::Ref(cell) => {
                let value = cell.load().ok_or_else(|| {
                    BridgeError::ContractViolation(format!(
                        "{}: by-ref argument {} has no value",
                        method, param.name
                    ))
                })?;
                write_value(&param.ty, &value, slot.bytes_mut(), arena)?;
            }
            // out slots stay zeroed
            Arg::Out(_) => {}
        }
        Ok(slot)
    }

    unsafe fn decode(
        method: &MethodId,
        slots: &[Slot],
        ret: &Slot,
        arena: &mut StringArena,
    ) -> Result<(Value, Vec<Option<Value>>)> {
        let value = read_value(&method.signature.ret, ret.bytes(), arena)?;
        let mut written = Vec::with_capacity(slots.len());
        for (param, slot) in method.signature.params.iter().zip(slots) {
            let value = match param.mode {
                PassMode::ByValue => None,
                PassMode::ByRef | PassMode::Out => Some(read_value(&param.ty, slot.bytes(), arena)?),
            };
            written.push(value);
        }
        Ok((value, written))
    }

    fn release_strings(library: &LibraryHandle, arena: &StringArena) {
        let strings = arena.native_strings();
        if strings.is_empty() {
            return;
        }
        match library.string_free() {
            Some(free) => {
                for &ptr in strings {
                    // SAFETY: each buffer was handed to us by the callee and is
                    // released exactly once.
                    unsafe { free(ptr as *mut c_char) };
                }
                trace!("Released {} native strings", strings.len());
            }
            None => warn!(
                "{} does not export {}, leaking {} strings",
                library.name(),
                abi::symbols::STRING_FREE,
                strings.len()
            ),
        }
    }
}

fn annotate(method: &MethodId, param: &Param, err: BridgeError) -> BridgeError {
    match err {
        BridgeError::Marshal(reason) => {
            BridgeError::Marshal(format!("{}: parameter {}: {}", method, param.name, reason))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::ReferenceCell;
    use crate::channel::{report_error, NativeObject};
    use crate::platform::StaticModule;
    use abi::{ErrorKind, NativeError};
    use std::ptr;

    unsafe extern "C" fn add(args: *mut *mut c_void, _argc: u32, ret: *mut c_void) {
        let a = *(*args.add(0) as *const i32);
        let b = *(*args.add(1) as *const i32);
        *(ret as *mut i32) = a + b;
    }

    unsafe extern "C" fn toggle(args: *mut *mut c_void, _argc: u32, _ret: *mut c_void) {
        let flag = *args.add(0) as *mut bool;
        *flag = !*flag;
    }

    unsafe extern "C" fn write_pair(args: *mut *mut c_void, _argc: u32, _ret: *mut c_void) {
        *(*args.add(0) as *mut i32) = 0;
        *(*args.add(1) as *mut usize) = 0;
    }

    unsafe extern "C" fn write_then_throw(args: *mut *mut c_void, _argc: u32, ret: *mut c_void) {
        *(*args.add(0) as *mut i32) = 99;
        *(ret as *mut i32) = 99;
        report_error(NativeError::new(ErrorKind::ExceptionThrown, ptr::null_mut(), ptr::null()));
    }

    fn library() -> LibraryHandle {
        LibraryHandle::for_module(
            "managed",
            Box::new(
                StaticModule::new()
                    .with_symbol("Math_Add", add as *const c_void)
                    .with_symbol("Flags_Toggle", toggle as *const c_void)
                    .with_symbol("Flags_Pair", write_pair as *const c_void)
                    .with_symbol("Flags_Explode", write_then_throw as *const c_void),
            ),
        )
    }

    fn marshaler() -> Marshaler {
        Marshaler::new(ErrorChannel::new(), StringOwnership::Native)
    }

    #[test]
    fn descriptor_naming() {
        let call = CallDescriptor::new("Tests.Parameters", "Ref")
            .by_ref::<bool>("b")
            .by_ref::<Option<String>>("s");
        assert_eq!(call.symbol(), "Tests_Parameters_Ref");
        assert_eq!(call.method().to_string(), "Tests.Parameters:Ref(bool&,string&)");

        let call = CallDescriptor::new("Math", "Add").entry_point("Math_Add_2");
        assert_eq!(call.symbol(), "Math_Add_2");
        assert_eq!(call.method().to_string(), "Math:Add()");
    }

    #[test]
    fn by_value_arguments_and_return() {
        let call = CallDescriptor::new("Math", "Add")
            .by_value::<i32>("a")
            .by_value::<i32>("b")
            .returns::<i32>();
        let value = marshaler()
            .invoke(&library(), &call, &mut [Arg::value(40), Arg::value(2)])
            .unwrap();
        assert_eq!(value, Value::I32(42));
    }

    #[test]
    fn by_ref_writes_back() {
        let call = CallDescriptor::new("Flags", "Toggle").by_ref::<bool>("flag");
        let mut flag = ReferenceCell::new(true);
        marshaler()
            .invoke(&library(), &call, &mut [flag.by_ref().into()])
            .unwrap();
        assert_eq!(flag.get().unwrap(), &false);
    }

    #[test]
    fn fault_discards_writebacks() {
        let call = CallDescriptor::new("Flags", "Explode")
            .by_ref::<i32>("value")
            .returns::<i32>();
        let mut value = ReferenceCell::new(1);
        let marshaler = marshaler();
        let err = marshaler
            .invoke(&library(), &call, &mut [value.by_ref().into()])
            .unwrap_err();

        assert!(matches!(err, BridgeError::ManagedExceptionThrown(_)));
        assert_eq!(value.get().unwrap(), &1);
        assert!(!marshaler.channel.is_pending());
    }

    #[test]
    fn failed_conversion_writes_no_cell() {
        let call = CallDescriptor::new("Flags", "Pair")
            .out::<i32>("count")
            .out::<NativeObject>("owner");
        let mut count = ReferenceCell::new(5i32);
        let mut owner = ReferenceCell::<NativeObject>::unset();
        let err = marshaler()
            .invoke(&library(), &call, &mut [count.out().into(), owner.out().into()])
            .unwrap_err();

        assert!(matches!(err, BridgeError::Marshal(_)));
        assert_eq!(count.get().unwrap(), &5);
        assert!(!owner.is_set());
    }

    #[test]
    fn mismatches_fail_before_the_call() {
        let lib = library();
        let call = CallDescriptor::new("Math", "Add")
            .by_value::<i32>("a")
            .by_value::<i32>("b")
            .returns::<i32>();

        let err = marshaler().invoke(&lib, &call, &mut [Arg::value(1)]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Marshaling error: Math:Add(int,int) takes 2 arguments, got 1"
        );

        let err = marshaler()
            .invoke(&lib, &call, &mut [Arg::value(1), Arg::value(true)])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Marshaling error: Math:Add(int,int): parameter b: expected int, got bool"
        );

        let toggle = CallDescriptor::new("Flags", "Toggle").by_ref::<bool>("flag");
        let mut wrong = ReferenceCell::new(1u8);
        assert!(matches!(
            marshaler().invoke(&lib, &toggle, &mut [wrong.by_ref().into()]),
            Err(BridgeError::Marshal(_))
        ));
        let mut flag = ReferenceCell::new(true);
        assert!(matches!(
            marshaler().invoke(&lib, &toggle, &mut [flag.out().into()]),
            Err(BridgeError::Marshal(_))
        ));
    }

    #[test]
    fn unset_by_ref_cell_is_a_contract_violation() {
        let call = CallDescriptor::new("Flags", "Toggle").by_ref::<bool>("flag");
        let mut flag = ReferenceCell::<bool>::unset();
        assert!(matches!(
            marshaler().invoke(&library(), &call, &mut [flag.by_ref().into()]),
            Err(BridgeError::ContractViolation(_))
        ));
    }

    #[test]
    fn missing_entry_point_is_a_method_lookup_failure() {
        let call = CallDescriptor::new("Math", "Subtract");
        let err = marshaler().invoke(&library(), &call, &mut []).unwrap_err();
        assert_eq!(err.code(), Some(abi::MONO_EMBEDDINATOR_METHOD_LOOKUP_FAILED));
    }
}
