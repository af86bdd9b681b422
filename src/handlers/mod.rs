pub mod diagnostics;
pub mod documents;
pub mod health;
