//! Runtime storage owned by an instance: linear memory, table and globals.

pub mod global;
pub mod memory;
pub mod table;

pub use global::GlobalSlot;
pub use memory::{Memory, MAX_PAGES, PAGE_SIZE};
pub use table::Table;
