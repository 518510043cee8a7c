// src/lib.rs

pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod extract;
pub mod keygen;
pub mod logging;
pub mod pipeline;
pub mod remote_config;
pub mod server;
pub mod service;
pub mod storage;
pub mod supervisor;
