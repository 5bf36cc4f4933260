pub mod application_types;
pub mod change_filter;
pub mod common;
pub mod config;
pub mod config_binding;
pub mod controller;
pub mod error;
pub mod ownership;
pub mod pipeline;
pub mod resources;
pub mod revision;
pub mod store;

pub use error::Error;
