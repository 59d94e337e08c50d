pub mod catalog;
pub mod change;
pub mod engine;
pub mod memory;
pub mod persistence;
pub mod table;

pub use engine::{InstanceFilter, InstancePatch, Store, Transaction};
pub use memory::MemoryStore;
pub use persistence::DurabilityMode;
pub use table::{InstanceTable, RecordTable, Table};
