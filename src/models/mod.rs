//! Data models

mod role;
mod service;
mod template;
mod vm;

pub use role::*;
pub use service::*;
pub use template::*;
pub use vm::*;
