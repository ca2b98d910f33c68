pub mod aggregate;
pub mod autopopulate;
pub mod error;
#[cfg(test)]
pub mod memory;
pub mod render;
pub mod service;
pub mod source;
pub mod store;
