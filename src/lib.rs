//! Library crate for slug-scan-rs exposing reusable modules.
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod database;
pub mod fetch;
pub mod known;
pub mod scanner;
pub mod selftest;
pub mod server;
pub mod sink;
pub mod slugspace;
pub mod types;
