//! Render configuration module
//!
//! Loads the numeric and boolean knobs consumed by the render core from a
//! TOML file and environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Render core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Simulation step length in milliseconds
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    /// Host protocol revision the adapter is selected for
    #[serde(default = "default_protocol_revision")]
    pub protocol_revision: u32,

    /// Directory holding skeleton definition files
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Lower bound for per-tracker view distance overrides (blocks)
    #[serde(default = "default_min_view_distance")]
    pub min_view_distance: f32,

    /// Distance within which free-floating models are shown (blocks)
    #[serde(default = "default_max_view_distance")]
    pub max_view_distance: f32,

    /// Built-in mount controller used when a hitbox is created without one
    #[serde(default = "default_mount")]
    pub default_mount: String,

    /// Swallow inventory input from viewers rendered as a model with equipment hidden
    #[serde(default = "default_true")]
    pub block_inventory_while_hidden: bool,

    /// Ticks between a viewer being marked for spawn and the proxies going out
    #[serde(default = "default_hide_delay")]
    pub hide_delay_ticks: u32,

    /// Crossfade length and display interpolation duration in ticks
    #[serde(default = "default_lerp_frames")]
    pub lerp_frames: u32,

    /// Keyframes closer than this (seconds) are merged at import
    #[serde(default = "default_keyframe_merge_threshold")]
    pub keyframe_merge_threshold: f32,

    /// Maximum packet weight per flushed sub-bundle
    #[serde(default = "default_bundle_max_items")]
    pub bundle_max_items: usize,

    /// Skin profile lookup timeout in milliseconds
    #[serde(default = "default_skin_timeout")]
    pub skin_lookup_timeout_ms: u64,

    /// Texture used when a skin profile cannot be resolved
    #[serde(default = "default_fallback_skin_url")]
    pub fallback_skin_url: String,

    /// Reload worker count (0 = hardware concurrency)
    #[serde(default)]
    pub reload_threads: usize,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,
}

// Default value functions
fn default_tick_rate() -> u64 {
    50 // 20 ticks per second
}

fn default_protocol_revision() -> u32 {
    767
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("./models")
}

fn default_min_view_distance() -> f32 {
    5.0
}

fn default_max_view_distance() -> f32 {
    45.0
}

fn default_mount() -> String {
    "walk".to_string()
}

fn default_true() -> bool {
    true
}

fn default_hide_delay() -> u32 {
    1
}

fn default_lerp_frames() -> u32 {
    5
}

fn default_keyframe_merge_threshold() -> f32 {
    0.01
}

fn default_bundle_max_items() -> usize {
    4096
}

fn default_skin_timeout() -> u64 {
    3000
}

fn default_fallback_skin_url() -> String {
    "http://textures.minecraft.net/texture/31f477eb1a7beee631c2ca64d06f8f68fa93a3386d04452ab27f43acdf1b60cb".to_string()
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/rigsync.toml"),
            tick_rate_ms: default_tick_rate(),
            protocol_revision: default_protocol_revision(),
            model_dir: default_model_dir(),
            min_view_distance: default_min_view_distance(),
            max_view_distance: default_max_view_distance(),
            default_mount: default_mount(),
            block_inventory_while_hidden: default_true(),
            hide_delay_ticks: default_hide_delay(),
            lerp_frames: default_lerp_frames(),
            keyframe_merge_threshold: default_keyframe_merge_threshold(),
            bundle_max_items: default_bundle_max_items(),
            skin_lookup_timeout_ms: default_skin_timeout(),
            fallback_skin_url: default_fallback_skin_url(),
            reload_threads: 0,
            debug: false,
        }
    }
}

impl RenderConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("RIGSYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/rigsync.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RIGSYNC_TICK_RATE_MS") {
            if let Ok(rate) = val.parse() {
                self.tick_rate_ms = rate;
            }
        }
        if let Ok(val) = env::var("RIGSYNC_PROTOCOL_REVISION") {
            if let Ok(revision) = val.parse() {
                self.protocol_revision = revision;
            }
        }
        if let Ok(val) = env::var("RIGSYNC_MODEL_DIR") {
            self.model_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("RIGSYNC_MAX_VIEW_DISTANCE") {
            if let Ok(distance) = val.parse() {
                self.max_view_distance = distance;
            }
        }
        if let Ok(val) = env::var("RIGSYNC_RELOAD_THREADS") {
            if let Ok(threads) = val.parse() {
                self.reload_threads = threads;
            }
        }
        if let Ok(val) = env::var("RIGSYNC_BLOCK_INVENTORY") {
            self.block_inventory_while_hidden = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("RIGSYNC_DEBUG") {
            self.debug = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(10..=1000).contains(&self.tick_rate_ms) {
            anyhow::bail!("Tick rate must be between 10ms and 1000ms");
        }
        if self.min_view_distance < 0.0 || self.min_view_distance > self.max_view_distance {
            anyhow::bail!("View distances must satisfy 0 <= min <= max");
        }
        if self.bundle_max_items == 0 {
            anyhow::bail!("Bundle item threshold must be positive");
        }
        if self.keyframe_merge_threshold < 0.0 {
            anyhow::bail!("Keyframe merge threshold must not be negative");
        }
        Ok(())
    }

    /// Length of one simulation step in seconds
    pub fn tick_seconds(&self) -> f32 {
        self.tick_rate_ms as f32 / 1000.0
    }

    /// Clamp a per-tracker view distance into the configured bounds
    pub fn clamp_view_distance(&self, distance: f32) -> f32 {
        distance.clamp(self.min_view_distance, self.max_view_distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RenderConfig::default();
        assert_eq!(config.tick_rate_ms, 50);
        assert_eq!(config.protocol_revision, 767);
        assert_eq!(config.lerp_frames, 5);
        assert!(config.block_inventory_while_hidden);
        assert!((config.tick_seconds() - 0.05).abs() < f32::EPSILON);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = RenderConfig::from_toml(
            r#"
            tick_rate_ms = 100
            max_view_distance = 64.0
            default_mount = "fly"
            "#,
        )
        .unwrap();
        assert_eq!(config.tick_rate_ms, 100);
        assert_eq!(config.max_view_distance, 64.0);
        assert_eq!(config.default_mount, "fly");
        // Untouched fields keep their defaults
        assert_eq!(config.bundle_max_items, 4096);
    }

    #[test]
    fn test_validation() {
        let mut config = RenderConfig::default();
        assert!(config.validate().is_ok());

        config.tick_rate_ms = 5;
        assert!(config.validate().is_err());
        config.tick_rate_ms = 50;

        config.min_view_distance = 100.0;
        assert!(config.validate().is_err());
        config.min_view_distance = 5.0;

        config.bundle_max_items = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clamp_view_distance() {
        let config = RenderConfig::default();
        assert_eq!(config.clamp_view_distance(1.0), 5.0);
        assert_eq!(config.clamp_view_distance(20.0), 20.0);
        assert_eq!(config.clamp_view_distance(500.0), 45.0);
    }
}
