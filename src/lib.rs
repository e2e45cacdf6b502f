#![forbid(unsafe_code)]

pub mod app;
pub mod audit;
pub mod cli;
pub mod commands;
pub mod config;
pub mod dedup;
pub mod discover;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod gate;
pub mod health;
pub mod logging;
pub mod model;
pub mod notify;
pub mod summarize;
pub mod text;
