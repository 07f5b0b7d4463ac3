//! Warden daemon: configuration and the HTTP control surface

pub mod api;
pub mod config;
