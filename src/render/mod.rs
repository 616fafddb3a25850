//! Render module
//!
//! Turns skeleton instances into per-viewer synthetic entities:
//! - Render proxies (item displays) and their dirty tracking
//! - HitBox proxies and mount controllers
//! - Trackers, the per-instance state machine
//! - The concurrent tracker registry

pub mod flags;
pub mod hitbox;
pub mod mount;
pub mod proxy;
pub mod registry;
pub mod tracker;

pub use flags::ProxyFlags;
pub use hitbox::{BodyState, DamageOutcome, HitBoxListener, HitBoxProxy};
pub use mount::{MountController, MoveType, RiderInput};
pub use proxy::{DisplayState, RenderProxy};
pub use registry::{EntityIdAllocator, TrackerRegistry};
pub use tracker::{
    AnimationModifier, AnimationState, BonePredicate, HideOptions, LifecycleState, TickContext,
    Tracker, TrackerAction, TrackerId, TrackerSettings, TrackerSource, ViewerState,
};
