// src/lib.rs

pub mod api;
pub mod app_state;
pub mod chat;
pub mod config;
pub mod constants;
pub mod errors;
pub mod logging;
pub mod models;
pub mod stream;
pub mod ui;
pub mod utils;
