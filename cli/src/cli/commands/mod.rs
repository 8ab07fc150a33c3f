//! Command implementations.

pub mod browse;
pub mod completions;
pub mod init;
pub mod run;
pub mod screen;
pub mod status;
pub mod sync;
pub mod upload;
pub mod version;
