pub use std::sync::*;
pub use std::thread;
