//! The streamed endpoints this crate knows how to drive.
//!
//! A command only describes its request and how to derive a result from the
//! frames. Executing it is the job of [`crate::StreamExecutor`].
use async_trait::async_trait;

use crate::{DockerStreamError, RequestDescriptor, handler::ResultExtractor};

mod build_image;
mod log_container;
mod pull_image;
mod push_image;
mod wait_container;

pub use build_image::*;
pub use log_container::*;
pub use pull_image::*;
pub use push_image::*;
pub use wait_container::*;

#[async_trait]
pub trait StreamedCommand: Send + Sync {
    type Extractor: ResultExtractor;

    /// Assembles the request. Anything that can be validated locally, such as
    /// the build context, fails here before a connection is made.
    async fn request(&self) -> Result<RequestDescriptor, DockerStreamError>;

    fn extractor(&self) -> Self::Extractor;
}
