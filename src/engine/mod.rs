pub mod doc;

pub use doc::*;
