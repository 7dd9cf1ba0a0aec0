use crate::channel::NativeObject;
use crate::{BridgeError, Result};
use abi::Decimal;
use std::ffi::{c_char, c_void, CStr, CString};
use std::fmt;
use std::mem::{align_of, size_of};

/// Type of a value crossing the native boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Unit,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// NUL-terminated UTF-8, passed as `const char*`.
    String,
    /// Opaque managed object reference, passed as a pointer.
    Object,
    Struct(StructLayout),
}

impl ValueType {
    pub fn size(&self) -> usize {
        match self {
            Self::Unit => 0,
            Self::Bool => size_of::<bool>(),
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::String | Self::Object => size_of::<*const c_void>(),
            Self::Struct(layout) => layout.size(),
        }
    }

    /// C alignment on the current target (`u64` is 4-aligned on some 32-bit ABIs).
    pub fn align(&self) -> usize {
        match self {
            Self::Unit => 1,
            Self::Bool => align_of::<bool>(),
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => align_of::<u16>(),
            Self::I32 | Self::U32 => align_of::<u32>(),
            Self::F32 => align_of::<f32>(),
            Self::I64 | Self::U64 => align_of::<u64>(),
            Self::F64 => align_of::<f64>(),
            Self::String | Self::Object => align_of::<*const c_void>(),
            Self::Struct(layout) => layout.align(),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &str = match self {
            Self::Unit => "void",
            Self::Bool => "bool",
            Self::I8 => "sbyte",
            Self::U8 => "byte",
            Self::I16 => "short",
            Self::U16 => "ushort",
            Self::I32 => "int",
            Self::U32 => "uint",
            Self::I64 => "long",
            Self::U64 => "ulong",
            Self::F32 => "single",
            Self::F64 => "double",
            Self::String => "string",
            Self::Object => "object",
            Self::Struct(layout) => layout.name.as_str(),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub ty: ValueType,
}

/// Fixed-layout record. Fields are laid out in exactly the order they were
/// added, with C alignment rules; the order is part of the ABI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructLayout {
    pub name: String,
    fields: Vec<Field>,
}

impl StructLayout {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.fields.push(Field {
            name: name.into(),
            ty,
        });
        self
    }

    /// Layout of [`abi::Decimal`].
    pub fn decimal() -> Self {
        Self::new("System.Decimal")
            .field("sign_scale", ValueType::U32)
            .field("hi32", ValueType::U32)
            .field("lo64", ValueType::U64)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn offsets(&self) -> Vec<usize> {
        let mut offset = 0;
        self.fields
            .iter()
            .map(|field| {
                offset = align_up(offset, field.ty.align());
                let at = offset;
                offset += field.ty.size();
                at
            })
            .collect()
    }

    pub fn align(&self) -> usize {
        self.fields.iter().map(|f| f.ty.align()).max().unwrap_or(1)
    }

    pub fn size(&self) -> usize {
        let end = match (self.offsets().last(), self.fields.last()) {
            (Some(offset), Some(field)) => offset + field.ty.size(),
            _ => 0,
        };
        align_up(end, self.align())
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// A live value on the host side of the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    /// Null string or object reference.
    Null,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Object(NativeObject),
    Struct(Vec<Value>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Self::Unit => "void",
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::I8(_) => "sbyte",
            Self::U8(_) => "byte",
            Self::I16(_) => "short",
            Self::U16(_) => "ushort",
            Self::I32(_) => "int",
            Self::U32(_) => "uint",
            Self::I64(_) => "long",
            Self::U64(_) => "ulong",
            Self::F32(_) => "single",
            Self::F64(_) => "double",
            Self::String(_) => "string",
            Self::Object(_) => "object",
            Self::Struct(_) => "struct",
        }
    }
}

fn mismatch(expected: &ValueType, got: &Value) -> BridgeError {
    BridgeError::Marshal(format!("expected {}, got {}", expected, got.kind()))
}

/// Conversion between a Rust type and its boundary representation.
pub trait Marshal: Sized {
    fn value_type() -> ValueType;
    fn into_value(self) -> Value;
    fn from_value(value: Value) -> Result<Self>;
}

macro_rules! marshal_primitive {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Marshal for $ty {
                fn value_type() -> ValueType {
                    ValueType::$variant
                }

                fn into_value(self) -> Value {
                    Value::$variant(self)
                }

                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(mismatch(&ValueType::$variant, &other)),
                    }
                }
            }
        )*
    };
}

marshal_primitive! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

impl Marshal for () {
    fn value_type() -> ValueType {
        ValueType::Unit
    }

    fn into_value(self) -> Value {
        Value::Unit
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Unit => Ok(()),
            other => Err(mismatch(&ValueType::Unit, &other)),
        }
    }
}

/// A null native string reads back as the empty string; use `Option<String>`
/// to tell the two apart.
impl Marshal for String {
    fn value_type() -> ValueType {
        ValueType::String
    }

    fn into_value(self) -> Value {
        Value::String(self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            Value::Null => Ok(String::new()),
            other => Err(mismatch(&ValueType::String, &other)),
        }
    }
}

impl Marshal for Option<String> {
    fn value_type() -> ValueType {
        ValueType::String
    }

    fn into_value(self) -> Value {
        self.map_or(Value::Null, Value::String)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Some(s)),
            Value::Null => Ok(None),
            other => Err(mismatch(&ValueType::String, &other)),
        }
    }
}

impl Marshal for NativeObject {
    fn value_type() -> ValueType {
        ValueType::Object
    }

    fn into_value(self) -> Value {
        Value::Object(self)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(o) => Ok(o),
            other => Err(mismatch(&ValueType::Object, &other)),
        }
    }
}

impl Marshal for Option<NativeObject> {
    fn value_type() -> ValueType {
        ValueType::Object
    }

    fn into_value(self) -> Value {
        self.map_or(Value::Null, Value::Object)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(o) => Ok(Some(o)),
            Value::Null => Ok(None),
            other => Err(mismatch(&ValueType::Object, &other)),
        }
    }
}

impl Marshal for Decimal {
    fn value_type() -> ValueType {
        ValueType::Struct(StructLayout::decimal())
    }

    fn into_value(self) -> Value {
        Value::Struct(vec![
            Value::U32(self.sign_scale),
            Value::U32(self.hi32),
            Value::U64(self.lo64),
        ])
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Struct(fields) => match fields.as_slice() {
                [Value::U32(sign_scale), Value::U32(hi32), Value::U64(lo64)] => Ok(Decimal {
                    sign_scale: *sign_scale,
                    hi32: *hi32,
                    lo64: *lo64,
                }),
                _ => Err(BridgeError::Marshal(format!(
                    "struct does not match {}",
                    StructLayout::decimal().name
                ))),
            },
            other => Err(mismatch(&Self::value_type(), &other)),
        }
    }
}

/// Strings allocated for one call, and the native buffers seen while reading
/// results back.
#[derive(Debug, Default)]
pub(crate) struct StringArena {
    owned: Vec<CString>,
    native: Vec<usize>,
}

impl StringArena {
    fn intern(&mut self, s: &str) -> Result<usize> {
        let c = CString::new(s)
            .map_err(|_| BridgeError::Marshal("string contains an interior NUL byte".into()))?;
        let ptr = c.as_ptr() as usize;
        self.owned.push(c);
        Ok(ptr)
    }

    fn is_owned(&self, ptr: usize) -> bool {
        self.owned.iter().any(|c| c.as_ptr() as usize == ptr)
    }

    fn note_native(&mut self, ptr: usize) {
        if !self.native.contains(&ptr) {
            self.native.push(ptr);
        }
    }

    /// Distinct native string buffers read during this call.
    pub(crate) fn native_strings(&self) -> &[usize] {
        &self.native
    }
}

fn take<const N: usize>(buf: &[u8]) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&buf[..N]);
    bytes
}

/// Encode `value` into `buf`, which is exactly `ty.size()` bytes.
pub(crate) fn write_value(
    ty: &ValueType,
    value: &Value,
    buf: &mut [u8],
    arena: &mut StringArena,
) -> Result<()> {
    fn put(buf: &mut [u8], bytes: &[u8]) {
        buf[..bytes.len()].copy_from_slice(bytes);
    }

    match (ty, value) {
        (ValueType::Unit, Value::Unit) => {}
        (ValueType::Bool, Value::Bool(v)) => buf[0] = *v as u8,
        (ValueType::I8, Value::I8(v)) => put(buf, &v.to_ne_bytes()),
        (ValueType::U8, Value::U8(v)) => put(buf, &v.to_ne_bytes()),
        (ValueType::I16, Value::I16(v)) => put(buf, &v.to_ne_bytes()),
        (ValueType::U16, Value::U16(v)) => put(buf, &v.to_ne_bytes()),
        (ValueType::I32, Value::I32(v)) => put(buf, &v.to_ne_bytes()),
        (ValueType::U32, Value::U32(v)) => put(buf, &v.to_ne_bytes()),
        (ValueType::I64, Value::I64(v)) => put(buf, &v.to_ne_bytes()),
        (ValueType::U64, Value::U64(v)) => put(buf, &v.to_ne_bytes()),
        (ValueType::F32, Value::F32(v)) => put(buf, &v.to_ne_bytes()),
        (ValueType::F64, Value::F64(v)) => put(buf, &v.to_ne_bytes()),
        (ValueType::String, Value::String(s)) => put(buf, &arena.intern(s)?.to_ne_bytes()),
        (ValueType::Object, Value::Object(o)) => put(buf, &o.addr().to_ne_bytes()),
        (ValueType::String | ValueType::Object, Value::Null) => put(buf, &0usize.to_ne_bytes()),
        (ValueType::Struct(layout), Value::Struct(values)) => {
            if values.len() != layout.fields().len() {
                return Err(BridgeError::Marshal(format!(
                    "{} has {} fields, got {}",
                    layout.name,
                    layout.fields().len(),
                    values.len()
                )));
            }
            for ((field, offset), value) in layout.fields().iter().zip(layout.offsets()).zip(values) {
                let end = offset + field.ty.size();
                write_value(&field.ty, value, &mut buf[offset..end], arena)?;
            }
        }
        (ty, other) => return Err(mismatch(ty, other)),
    }
    Ok(())
}

/// Decode a value of type `ty` from `buf`.
///
/// # Safety
/// Any non-null string pointer in `buf` must point at a NUL-terminated buffer
/// that stays valid for the duration of the call.
pub(crate) unsafe fn read_value(ty: &ValueType, buf: &[u8], arena: &mut StringArena) -> Result<Value> {
    let value = match ty {
        ValueType::Unit => Value::Unit,
        ValueType::Bool => Value::Bool(buf[0] != 0),
        ValueType::I8 => Value::I8(i8::from_ne_bytes(take(buf))),
        ValueType::U8 => Value::U8(buf[0]),
        ValueType::I16 => Value::I16(i16::from_ne_bytes(take(buf))),
        ValueType::U16 => Value::U16(u16::from_ne_bytes(take(buf))),
        ValueType::I32 => Value::I32(i32::from_ne_bytes(take(buf))),
        ValueType::U32 => Value::U32(u32::from_ne_bytes(take(buf))),
        ValueType::I64 => Value::I64(i64::from_ne_bytes(take(buf))),
        ValueType::U64 => Value::U64(u64::from_ne_bytes(take(buf))),
        ValueType::F32 => Value::F32(f32::from_ne_bytes(take(buf))),
        ValueType::F64 => Value::F64(f64::from_ne_bytes(take(buf))),
        ValueType::String => {
            let ptr = usize::from_ne_bytes(take(buf));
            if ptr == 0 {
                return Ok(Value::Null);
            }
            if !arena.is_owned(ptr) {
                arena.note_native(ptr);
            }
            let s = CStr::from_ptr(ptr as *const c_char)
                .to_str()
                .map_err(|_| BridgeError::Marshal("native string is not valid UTF-8".into()))?;
            Value::String(s.to_owned())
        }
        ValueType::Object => match usize::from_ne_bytes(take(buf)) {
            0 => Value::Null,
            addr => Value::Object(NativeObject::from_addr(addr)),
        },
        ValueType::Struct(layout) => {
            let mut values = Vec::with_capacity(layout.fields().len());
            for (field, offset) in layout.fields().iter().zip(layout.offsets()) {
                let end = offset + field.ty.size();
                values.push(read_value(&field.ty, &buf[offset..end], arena)?);
            }
            Value::Struct(values)
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(ty: &ValueType, value: &Value) -> Vec<u8> {
        let mut buf = vec![0u8; ty.size()];
        let mut arena = StringArena::default();
        write_value(ty, value, &mut buf, &mut arena).unwrap();
        buf
    }

    #[test]
    fn decimal_layout_matches_repr_c() {
        let layout = StructLayout::decimal();
        assert_eq!(layout.size(), std::mem::size_of::<Decimal>());
        assert_eq!(layout.align(), std::mem::align_of::<Decimal>());
        assert_eq!(layout.offsets(), vec![0, 4, 8]);
    }

    #[test]
    fn receiving_side_reconstructs_decimal_fields() {
        let sent = Decimal::from_parts(0x1234_5678_9abc_def0_1122, 4, true).unwrap();
        let bytes = encode(&Decimal::value_type(), &sent.into_value());

        let received: Decimal = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(received, sent);
        assert_eq!(received.scale(), 4);
        assert!(received.is_negative());
    }

    #[test]
    fn field_order_is_carried_by_the_layout() {
        let reordered = StructLayout::new("Reordered")
            .field("lo64", ValueType::U64)
            .field("hi32", ValueType::U32)
            .field("sign_scale", ValueType::U32);
        let ty = ValueType::Struct(reordered);
        let value = Value::Struct(vec![Value::U64(3), Value::U32(2), Value::U32(1)]);
        let bytes = encode(&ty, &value);

        assert_eq!(&bytes[0..8], &3u64.to_ne_bytes());
        assert_eq!(&bytes[8..12], &2u32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &1u32.to_ne_bytes());

        let mut arena = StringArena::default();
        let back = unsafe { read_value(&ty, &bytes, &mut arena) }.unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn padding_follows_c_rules() {
        let layout = StructLayout::new("Padded")
            .field("flag", ValueType::Bool)
            .field("count", ValueType::I32)
            .field("tag", ValueType::U8);
        assert_eq!(layout.offsets(), vec![0, 4, 8]);
        assert_eq!(layout.size(), 12);
        assert_eq!(StructLayout::new("Empty").size(), 0);
    }

    #[test]
    fn strings_are_nul_terminated_utf8() {
        let mut buf = vec![0u8; ValueType::String.size()];
        let mut arena = StringArena::default();
        write_value(&ValueType::String, &Value::String("héllo".into()), &mut buf, &mut arena).unwrap();

        let back = unsafe { read_value(&ValueType::String, &buf, &mut arena) }.unwrap();
        assert_eq!(back, Value::String("héllo".into()));
        // our own buffer, nothing to release
        assert!(arena.native_strings().is_empty());
    }

    #[test]
    fn interior_nul_is_rejected() {
        let mut buf = vec![0u8; ValueType::String.size()];
        let mut arena = StringArena::default();
        let err = write_value(&ValueType::String, &Value::String("a\0b".into()), &mut buf, &mut arena);
        assert!(matches!(err, Err(BridgeError::Marshal(_))));
    }

    #[test]
    fn type_mismatch_is_a_marshal_error() {
        let mut buf = vec![0u8; 4];
        let mut arena = StringArena::default();
        let err = write_value(&ValueType::I32, &Value::Bool(true), &mut buf, &mut arena).unwrap_err();
        assert_eq!(err.to_string(), "Marshaling error: expected int, got bool");
    }

    #[test]
    fn null_string_reads_as_empty_or_none() {
        assert_eq!(String::from_value(Value::Null).unwrap(), "");
        assert_eq!(Option::<String>::from_value(Value::Null).unwrap(), None);
        assert!(i32::from_value(Value::Null).is_err());
    }
}
