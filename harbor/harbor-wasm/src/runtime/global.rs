//! Global variable: value plus its declared type.

use crate::error::Trap;
use crate::model::{GlobalType, Value};

#[derive(Debug, Clone)]
pub struct GlobalSlot {
    ty: GlobalType,
    val: Value,
}

impl GlobalSlot {
    pub fn new(ty: GlobalType, init: Value) -> Self {
        Self { ty, val: init }
    }

    pub fn get(&self) -> Value {
        self.val
    }

    /// Mutability is checked at load time; the value type is checked here.
    pub fn set(&mut self, v: Value) -> Result<(), Trap> {
        if !self.ty.mutable || v.ty() != self.ty.val_type {
            return Err(Trap::InvalidCode("global.set type mismatch"));
        }
        self.val = v;
        Ok(())
    }

    pub fn ty(&self) -> GlobalType {
        self.ty
    }
}
