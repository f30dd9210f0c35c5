//! termgate: one authenticated endpoint in front of on-demand terminal and editor backends.

#[cfg(not(unix))]
compile_error!("termgate only works on Unix hosts.");

pub mod auth;
pub mod binaries;
pub mod config;
pub mod error;
pub mod fs_api;
pub mod http_server;
pub mod pages;
pub mod persist;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod rate_limit;
pub mod registry;
pub mod state;
pub mod tools;
