//! HTTP API for service templates and services

mod handlers;
mod server;
mod types;

pub use server::{router, Server};
pub use types::*;
