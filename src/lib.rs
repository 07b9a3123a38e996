//! ffwatch - Supervised ffmpeg invocations with live progress
//!
//! Runs the media processor as a child process, drains its output streams concurrently,
//! turns its diagnostic output into progress and completion events, and maps every way a
//! run can end (exit, timeout, launch failure, interpretation failure) onto one result.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod patterns;
pub mod process;
pub mod setup;
pub mod workflow;
