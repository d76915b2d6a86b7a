use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FadeSettings {
    pub start_alpha: f32,
    pub target_alpha: f32,
    /// Alpha units per second.
    pub rate: f32,
}

impl Default for FadeSettings {
    fn default() -> Self {
        Self {
            start_alpha: 1.0,
            target_alpha: 0.0,
            rate: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    pub pause_poll_ms: u64,
    pub port_settings_timeout_ms: u64,
    pub renderer_tunnel_timeout_ms: u64,
    pub input_acquire_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            pause_poll_ms: 50,
            port_settings_timeout_ms: 10_000,
            renderer_tunnel_timeout_ms: 1000,
            input_acquire_timeout_ms: 100,
        }
    }
}

impl PipelineSettings {
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn port_settings_timeout(&self) -> Duration {
        Duration::from_millis(self.port_settings_timeout_ms)
    }

    pub fn renderer_tunnel_timeout(&self) -> Duration {
        Duration::from_millis(self.renderer_tunnel_timeout_ms)
    }

    pub fn input_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.input_acquire_timeout_ms)
    }
}

/// Tuning for the in-process decoder used when no hardware framework is bound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SoftDecoderSettings {
    /// Presentation rate; 0 disables pacing.
    pub frame_rate: f32,
    pub input_buffers: usize,
    pub input_buffer_size: usize,
}

impl Default for SoftDecoderSettings {
    fn default() -> Self {
        Self {
            frame_rate: 30.0,
            input_buffers: 3,
            input_buffer_size: 80 * 1024,
        }
    }
}

impl SoftDecoderSettings {
    pub fn frame_interval(&self) -> Duration {
        if self.frame_rate > 0.0 {
            Duration::from_secs_f32(1.0 / self.frame_rate)
        } else {
            Duration::ZERO
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlayerSettings {
    pub image_width: u32,
    pub image_height: u32,
    pub fade: FadeSettings,
    pub pipeline: PipelineSettings,
    pub soft_decoder: SoftDecoderSettings,
    pub shutdown_poll_ms: u64,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            image_width: 1920,
            image_height: 1080,
            fade: FadeSettings::default(),
            pipeline: PipelineSettings::default(),
            soft_decoder: SoftDecoderSettings::default(),
            shutdown_poll_ms: 50,
        }
    }
}

impl PlayerSettings {
    /// Load `<config_dir>/vidfade/settings.json`, falling back to defaults.
    pub fn load() -> Self {
        let Some(config_dir) = dirs::config_dir() else {
            return Self::default();
        };
        Self::load_from(&config_dir.join("vidfade").join("settings.json"))
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(settings) => {
                    log::info!("Loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    log::warn!("Ignoring malformed {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms)
    }
}
