// SPDX-License-Identifier: CEPL-1.0
use serde::Deserialize;
use std::path::PathBuf;

/// Runtime knobs for the Vulkan backend. Deserializes from the `[vulkan]`
/// table of the app config; every field has a default.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct VkConfig {
    /// Enables the Khronos validation layer and the debug messenger.
    pub validation: bool,
    pub present_mode: PresentModePreference,
    pub device: DeviceRequirements,
    /// Directory holding `triangle.vert.spv` / `triangle.frag.spv`.
    /// Built-in blobs are used when unset.
    pub shader_dir: Option<PathBuf>,
    pub clear_color: [f32; 4],
}

impl Default for VkConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            present_mode: PresentModePreference::default(),
            device: DeviceRequirements::default(),
            shader_dir: None,
            clear_color: [0.02, 0.02, 0.04, 1.0],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePreference {
    /// Low latency, falls back to FIFO.
    #[default]
    Mailbox,
    /// Vsync-locked.
    Fifo,
}

/// Suitability criteria beyond the hard requirements (complete queues,
/// swapchain extension, non-empty surface formats and present modes).
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceRequirements {
    pub require_discrete: bool,
    pub require_geometry_shader: bool,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            require_discrete: true,
            require_geometry_shader: true,
        }
    }
}

impl DeviceRequirements {
    /// Accept any GPU that can present.
    pub const RELAXED: Self = Self {
        require_discrete: false,
        require_geometry_shader: false,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_yields_defaults() {
        let cfg: VkConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, VkConfig::default());
    }

    #[test]
    fn partial_table_overrides_only_named_fields() {
        let cfg: VkConfig = toml::from_str(
            r#"
            validation = false
            present_mode = "fifo"

            [device]
            require_discrete = false
            "#,
        )
        .unwrap();
        assert!(!cfg.validation);
        assert_eq!(cfg.present_mode, PresentModePreference::Fifo);
        assert!(!cfg.device.require_discrete);
        assert!(cfg.device.require_geometry_shader);
        assert_eq!(cfg.shader_dir, None);
    }

    #[test]
    fn unknown_present_mode_is_rejected() {
        assert!(toml::from_str::<VkConfig>(r#"present_mode = "immediate""#).is_err());
    }
}
