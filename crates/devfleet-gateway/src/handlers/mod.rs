//! HTTP request handlers.

pub mod devices;
pub mod health;
