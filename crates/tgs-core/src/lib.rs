//! Core domain + application logic for the Telegram group scanner.
//!
//! This crate is intentionally framework-agnostic. Telegram / OCR / the AI
//! completion API live behind ports (traits) implemented in adapter crates.

pub mod app;
pub mod command;
pub mod config;
pub mod domain;
pub mod errors;
pub mod filter;
pub mod logging;
pub mod ports;
pub mod processor;
pub mod resilience;
pub mod responder;
pub mod scanner;
pub mod storage;
pub mod utils;

pub use errors::{Error, ErrorClass, Result};
