#[macro_use]
pub mod error;

pub mod config;
pub mod events;
pub mod expirer;
pub mod http;
pub mod metadata;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod supervisor;
