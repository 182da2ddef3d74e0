//! ledhubd: LED device lifecycle management and network service discovery.

pub mod api;
pub mod config;
pub mod controller;
pub mod device;
pub mod discovery;
pub mod error;
pub mod output;
