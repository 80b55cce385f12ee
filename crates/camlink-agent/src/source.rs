//! External collaborators consumed by the session

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("camera interface init failed: {0}")]
    Camera(String),

    #[error("network stack init failed: {0}")]
    Network(String),
}

/// Supplies raw frames to the stream loop
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Next frame, or `None` when nothing is ready this tick
    async fn get_frame(&self) -> Option<Vec<u8>>;
}

/// Source that never yields; video then flows only through the relay port
#[derive(Debug, Default)]
pub struct IdleSource;

#[async_trait]
impl StreamSource for IdleSource {
    async fn get_frame(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Device bring-up run once before the first connection
#[async_trait]
pub trait PlatformInit: Send + Sync {
    async fn init_camera_interface(&self) -> Result<(), PlatformError>;
    async fn init_network_stack(&self) -> Result<(), PlatformError>;
}
