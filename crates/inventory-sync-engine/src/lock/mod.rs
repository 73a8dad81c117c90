mod memory;

pub use memory::MemoryLockManager;
