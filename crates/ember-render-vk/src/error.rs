// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

/// Everything the Vulkan backend can fail with.
///
/// Out-of-date and suboptimal presentation are not errors; they come back as
/// [`AcquireOutcome`](crate::frame::AcquireOutcome) and
/// [`PresentOutcome`](crate::frame::PresentOutcome).
#[derive(Debug, Error)]
pub enum VkError {
    #[error("failed to load the Vulkan loader: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("failed to create Vulkan instance: {0}")]
    InstanceCreation(vk::Result),

    #[error("failed to create presentation surface: {0}")]
    SurfaceCreation(vk::Result),

    #[error("no suitable GPU among {examined} physical device(s)")]
    NoSuitableDevice { examined: usize },

    #[error("failed to create logical device: {0}")]
    DeviceCreation(vk::Result),

    #[error("failed to create command pool: {0}")]
    CommandPoolCreation(vk::Result),

    #[error("failed to create swapchain: {0}")]
    SwapchainCreation(vk::Result),

    #[error("failed to allocate {size}-byte buffer: {result}")]
    BufferAllocation {
        size: vk::DeviceSize,
        result: vk::Result,
    },

    #[error("no memory type in filter {type_filter:#b} supports {required:?}")]
    UnsupportedMemoryType {
        type_filter: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("refusing to upload an empty buffer")]
    EmptyUpload,

    #[error("buffer was created without TRANSFER_SRC and cannot be read back")]
    ReadbackUnsupported,

    #[error("failed to load {stage} shader: {reason}")]
    ShaderLoad { stage: &'static str, reason: String },

    #[error("failed to create graphics pipeline: {0}")]
    PipelineCreation(vk::Result),

    #[error("failed to create frame synchronization objects: {0}")]
    SyncCreation(vk::Result),

    #[error("failed to acquire swapchain image: {0}")]
    SwapchainAcquire(vk::Result),

    #[error("failed to present swapchain image: {0}")]
    SwapchainPresent(vk::Result),

    #[error("{op} failed: {result}")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
    },
}

pub type VkResult<T> = Result<T, VkError>;

pub(crate) trait VkResultExt<T> {
    /// Tags a raw `vk::Result` failure with the call that produced it.
    fn op(self, op: &'static str) -> VkResult<T>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn op(self, op: &'static str) -> VkResult<T> {
        self.map_err(|result| VkError::Vulkan { op, result })
    }
}
