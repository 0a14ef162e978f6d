//! Funcref table holding function indices for `call_indirect`.

use crate::error::Trap;
use crate::model::{FuncIdx, TableType};

#[derive(Debug, Clone, Default)]
pub struct Table {
    elems: Vec<Option<FuncIdx>>,
}

impl Table {
    pub fn new(ty: &TableType) -> Self {
        Self { elems: vec![None; ty.limits.min as usize] }
    }

    pub fn size(&self) -> u32 {
        self.elems.len() as u32
    }

    /// Function stored at `idx`, trapping on holes and out-of-range indices.
    pub fn get(&self, idx: u32) -> Result<FuncIdx, Trap> {
        match self.elems.get(idx as usize) {
            Some(Some(f)) => Ok(*f),
            Some(None) => Err(Trap::UninitializedElement),
            None => Err(Trap::UndefinedElement),
        }
    }

    /// Write `funcs` starting at `offset`. Nothing is written unless the whole
    /// range fits.
    pub fn init(&mut self, offset: u32, funcs: &[FuncIdx]) -> Result<(), ()> {
        let start = offset as usize;
        let end = start.checked_add(funcs.len()).ok_or(())?;
        let slots = self.elems.get_mut(start..end).ok_or(())?;
        for (slot, &f) in slots.iter_mut().zip(funcs) {
            *slot = Some(f);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Limits;

    #[test]
    fn holes_and_bounds() {
        let mut t = Table::new(&TableType { limits: Limits::new(3, None), ..Default::default() });
        t.init(1, &[7]).unwrap();
        assert_eq!(t.get(1), Ok(7));
        assert_eq!(t.get(0), Err(Trap::UninitializedElement));
        assert_eq!(t.get(3), Err(Trap::UndefinedElement));
    }

    #[test]
    fn init_is_all_or_nothing() {
        let mut t = Table::new(&TableType { limits: Limits::new(2, None), ..Default::default() });
        assert!(t.init(1, &[4, 5]).is_err());
        assert_eq!(t.get(1), Err(Trap::UninitializedElement));
    }
}
