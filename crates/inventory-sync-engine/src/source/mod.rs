mod http;
mod memory;

pub use http::HttpRowSource;
pub use memory::MemorySource;
