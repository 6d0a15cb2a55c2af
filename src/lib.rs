pub mod config;
pub mod domain;
pub mod logging;
pub mod server;
pub mod services;
