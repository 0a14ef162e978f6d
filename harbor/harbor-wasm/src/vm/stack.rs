//! Value stack for the interpreter.
//!
//! Operand types are not validated ahead of time, so typed pops double as the
//! runtime type check.

use crate::error::Trap;
use crate::model::Value;

const TYPE_MISMATCH: Trap = Trap::InvalidCode("operand type mismatch");
const UNDERFLOW: Trap = Trap::InvalidCode("value stack underflow");

#[derive(Debug)]
pub struct ValueStack {
    stack: Vec<Value>,
    max: usize,
}

impl ValueStack {
    pub fn new(max: usize) -> Self {
        Self { stack: Vec::new(), max }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    #[inline]
    pub fn push(&mut self, v: Value) -> Result<(), Trap> {
        if self.stack.len() >= self.max {
            return Err(Trap::StackExhausted);
        }
        self.stack.push(v);
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value, Trap> {
        self.stack.pop().ok_or(UNDERFLOW)
    }

    #[inline]
    pub fn pop_i32(&mut self) -> Result<i32, Trap> {
        match self.pop()? {
            Value::I32(v) => Ok(v),
            _ => Err(TYPE_MISMATCH),
        }
    }

    #[inline]
    pub fn pop_i64(&mut self) -> Result<i64, Trap> {
        match self.pop()? {
            Value::I64(v) => Ok(v),
            _ => Err(TYPE_MISMATCH),
        }
    }

    #[inline]
    pub fn pop_f32(&mut self) -> Result<f32, Trap> {
        match self.pop()? {
            Value::F32(b) => Ok(f32::from_bits(b)),
            _ => Err(TYPE_MISMATCH),
        }
    }

    #[inline]
    pub fn pop_f64(&mut self) -> Result<f64, Trap> {
        match self.pop()? {
            Value::F64(b) => Ok(f64::from_bits(b)),
            _ => Err(TYPE_MISMATCH),
        }
    }

    #[inline]
    pub fn pop_f32_bits(&mut self) -> Result<u32, Trap> {
        match self.pop()? {
            Value::F32(b) => Ok(b),
            _ => Err(TYPE_MISMATCH),
        }
    }

    #[inline]
    pub fn pop_f64_bits(&mut self) -> Result<u64, Trap> {
        match self.pop()? {
            Value::F64(b) => Ok(b),
            _ => Err(TYPE_MISMATCH),
        }
    }

    #[inline]
    pub fn push_i32(&mut self, v: i32) -> Result<(), Trap> {
        self.push(Value::I32(v))
    }

    #[inline]
    pub fn push_i64(&mut self, v: i64) -> Result<(), Trap> {
        self.push(Value::I64(v))
    }

    #[inline]
    pub fn push_f32(&mut self, v: f32) -> Result<(), Trap> {
        self.push(Value::F32(v.to_bits()))
    }

    #[inline]
    pub fn push_f64(&mut self, v: f64) -> Result<(), Trap> {
        self.push(Value::F64(v.to_bits()))
    }

    #[inline]
    pub fn push_bool(&mut self, b: bool) -> Result<(), Trap> {
        self.push(Value::I32(i32::from(b)))
    }

    /// Remove the top `n` values, preserving their order.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, Trap> {
        let at = self.stack.len().checked_sub(n).ok_or(UNDERFLOW)?;
        Ok(self.stack.split_off(at))
    }

    /// Drop everything between `height` and the top `keep` values.
    pub fn unwind(&mut self, height: usize, keep: usize) -> Result<(), Trap> {
        let len = self.stack.len();
        if len < height + keep {
            return Err(UNDERFLOW);
        }
        self.stack.drain(height..len - keep);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwind_keeps_top_values() {
        let mut s = ValueStack::new(16);
        for v in 1..=5 {
            s.push_i32(v).unwrap();
        }
        s.unwind(1, 2).unwrap();
        assert_eq!(s.pop_n(3).unwrap(), vec![Value::I32(1), Value::I32(4), Value::I32(5)]);
        assert!(s.is_empty());
    }

    #[test]
    fn limit_and_type_checks() {
        let mut s = ValueStack::new(1);
        s.push_i64(1).unwrap();
        assert_eq!(s.push_i32(2), Err(Trap::StackExhausted));
        assert_eq!(s.pop_i32(), Err(TYPE_MISMATCH));
        assert_eq!(s.pop(), Err(UNDERFLOW));
    }
}
