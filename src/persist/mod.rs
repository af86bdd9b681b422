pub mod mem;
pub mod pg;
pub mod store;

pub use store::*;
