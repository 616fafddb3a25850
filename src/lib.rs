//! Rigsync Render Library
//!
//! Server-side rendering of animated composite models for a voxel game.
//! A model is a skeleton of bones; each visual bone is drawn by a display
//! entity that only exists on the clients that can see it, and every viewer
//! connection gets a channel that rewrites packets to keep those entities in
//! sync.
//!
//! ## Modules
//!
//! - `config` - Render configuration management
//! - `entity` - View of the host's real entities
//! - `error` - Error types and result definitions
//! - `model` - Skeletons, animation clips and the model store
//! - `net` - Viewers, packet bundles and per-viewer channels
//! - `protocol` - Packet model and revision adapters
//! - `reload` - Parallel model reload
//! - `render` - Trackers, render proxies, hitboxes and mounts
//! - `scheduler` - Sync and async task lanes
//! - `skin` - Player skin lookup
//! - `state` - Shared render context
//! - `world` - Fixed-rate simulation loop

pub mod config;
pub mod entity;
pub mod error;
pub mod model;
pub mod net;
pub mod protocol;
pub mod reload;
pub mod render;
pub mod scheduler;
pub mod skin;
pub mod state;
pub mod world;

// Re-export commonly used types
pub use config::RenderConfig;
pub use error::{Result, RigError};
pub use render::{Tracker, TrackerId, TrackerRegistry};
pub use state::RenderContext;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
