//! Ref/Out parameter cells.
//!
//! The ABI has no reference type, so by-ref and out parameters are modelled
//! as a cell the caller owns: the marshaler seeds a native slot from it before
//! the call and stores the slot back into it afterwards. [`Ref`] and [`Out`]
//! are two views over the same storage, so one cell can be passed by-ref to
//! one call and as an out parameter to the next without copying.

use crate::value::{Marshal, Value, ValueType};
use crate::{BridgeError, Result};
use log::error;

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCell<T> {
    value: Option<T>,
}

impl<T> ReferenceCell<T> {
    /// A cell holding `initial`, ready to be passed by reference.
    pub fn new(initial: T) -> Self {
        Self {
            value: Some(initial),
        }
    }

    /// A cell with no value yet, to be passed as an out parameter.
    pub fn unset() -> Self {
        Self { value: None }
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    /// Reading before the first write is a contract violation, never a
    /// silent default.
    pub fn get(&self) -> Result<&T> {
        self.value.as_ref().ok_or_else(|| {
            error!("Read of a reference cell before anything was written to it");
            BridgeError::ContractViolation("out value read before the callee assigned it".into())
        })
    }

    pub fn set(&mut self, value: T) {
        self.value = Some(value);
    }

    pub fn into_inner(self) -> Option<T> {
        self.value
    }

    pub fn by_ref(&mut self) -> Ref<'_, T> {
        Ref { cell: self }
    }

    pub fn out(&mut self) -> Out<'_, T> {
        Out { cell: self }
    }
}

impl<T> Default for ReferenceCell<T> {
    fn default() -> Self {
        Self::unset()
    }
}

/// Read-write view: the callee may overwrite the value.
#[derive(Debug)]
pub struct Ref<'a, T> {
    pub(crate) cell: &'a mut ReferenceCell<T>,
}

impl<T> Ref<'_, T> {
    pub fn get(&self) -> Result<&T> {
        self.cell.get()
    }

    pub fn set(&mut self, value: T) {
        self.cell.set(value);
    }
}

/// Write-first view: the callee assigns before the caller reads.
#[derive(Debug)]
pub struct Out<'a, T> {
    pub(crate) cell: &'a mut ReferenceCell<T>,
}

impl<T> Out<'_, T> {
    pub fn get(&self) -> Result<&T> {
        self.cell.get()
    }

    pub fn set(&mut self, value: T) {
        self.cell.set(value);
    }
}

/// Type-erased access to a cell, used by the marshaler.
pub trait CellSlot {
    fn value_type(&self) -> ValueType;
    fn load(&self) -> Option<Value>;
    /// Fails exactly when `store` would, without touching the cell.
    fn check(&self, value: &Value) -> Result<()>;
    fn store(&mut self, value: Value) -> Result<()>;
}

impl<T: Marshal + Clone> CellSlot for ReferenceCell<T> {
    fn value_type(&self) -> ValueType {
        T::value_type()
    }

    fn load(&self) -> Option<Value> {
        self.value.clone().map(Marshal::into_value)
    }

    fn check(&self, value: &Value) -> Result<()> {
        T::from_value(value.clone()).map(|_| ())
    }

    fn store(&mut self, value: Value) -> Result<()> {
        self.value = Some(T::from_value(value)?);
        Ok(())
    }
}
