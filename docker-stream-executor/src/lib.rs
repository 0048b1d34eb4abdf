//! Streamed command execution against the Docker Engine API
//!
//! Builds, pushes, pulls, waits and log follows all answer with a body that
//! streams frames until the operation is done. This crate issues those
//! requests, splits the body into frames, hands every frame to a caller
//! supplied handler and resolves a single awaitable outcome. Build contexts
//! are archived locally with `.dockerignore` rules applied, and invalid rules
//! or an excluded Dockerfile fail before anything is sent.
//!
//! # Example
//!
//! ```no_run
//! # use docker_stream_executor::{BuildImage, StreamExecutor, handler_fn};
//! # use std::time::Duration;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = StreamExecutor::connect().await?;
//!
//! let mut build = BuildImage::from_directory(".");
//! build.with_dockerfile("Dockerfile").with_tag("app:latest");
//!
//! let mut execution = executor
//!     .execute(&build, handler_fn(|frame| println!("{frame:?}")))
//!     .await?;
//! let image_id = execution
//!     .await_outcome(Some(Duration::from_secs(600)))
//!     .await?;
//! # Ok(())
//! # }
//! ```
mod auth;
mod client;
mod commands;
mod config;
mod context_builder;
mod errors;
mod execution;
mod frame_reader;
mod frames;
mod handler;
mod ignore_rules;
mod request;
mod stream_executor;
mod transport;
#[cfg(unix)]
mod unix_transport;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tests;

pub use auth::*;
pub use client::*;
pub use commands::*;
pub use config::*;
pub use context_builder::*;
pub use errors::*;
pub use execution::*;
pub use frame_reader::*;
pub use frames::*;
pub use handler::*;
pub use ignore_rules::*;
pub use request::*;
pub use stream_executor::*;
pub use transport::*;
#[cfg(unix)]
pub use unix_transport::*;
