pub mod awareness;
pub mod registry;
pub mod writer;

pub use registry::*;
pub use writer::{JoinResponse, RoomCmd, RoomStats};
