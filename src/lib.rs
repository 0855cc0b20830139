pub mod cli;
pub mod commands;
pub mod compose;
pub mod config;
pub mod exec;
pub mod health;
pub mod orchestrator;
pub mod platform;
pub mod provision;
pub mod ui;
