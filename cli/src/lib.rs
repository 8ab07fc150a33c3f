//! devsync - mirror a project folder onto a REPL-driven embedded device
//!
//! This crate provides the core functionality for the `devsync` CLI tool.
//!
//! # Architecture
//!
//! - [`sync`] - Device filesystem mirror, operation queue and sync engine
//! - [`transport`] - Exclusive link to the device (simulated or raw REPL)
//! - [`watcher`] - Local change notifications for the sync folder
//! - [`screen`] - Shape list to display-class compiler
//! - [`cli`] - Command-line interface using clap
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod screen;
pub mod sync;
pub mod transport;
pub mod watcher;

pub use error::{Error, Result};
