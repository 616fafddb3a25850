//! Skin profile lookup
//!
//! Player-head visuals can carry a skin texture fetched by profile id or
//! name. The actual HTTP lookup lives outside this crate behind
//! `ProfileResolver`; `SkinService` adds caching, a timeout and a fallback
//! texture so a failed lookup never stalls rendering.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SkinError;

/// A texture URL with its optional signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SkinTexture {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl SkinTexture {
    /// Create an unsigned texture
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            signature: None,
        }
    }

    /// Create a signed texture
    pub fn signed(url: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            signature: Some(signature.into()),
        }
    }
}

/// How a profile is looked up
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProfileKey {
    Id(Uuid),
    Name(String),
}

impl fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileKey::Id(id) => write!(f, "{}", id),
            ProfileKey::Name(name) => write!(f, "{}", name),
        }
    }
}

/// A resolved profile
#[derive(Debug, Clone, PartialEq)]
pub struct SkinProfile {
    pub id: Uuid,
    pub name: String,
    pub texture: SkinTexture,
}

/// Resolves a profile to its texture
pub trait ProfileResolver: Send + Sync {
    fn resolve(&self, key: &ProfileKey) -> BoxFuture<'static, Result<SkinProfile, SkinError>>;
}

/// In-memory resolver, used when no remote service is configured
#[derive(Debug, Default)]
pub struct MemoryResolver {
    profiles: RwLock<HashMap<ProfileKey, SkinProfile>>,
}

impl MemoryResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a profile under both its id and its name
    pub fn register(&self, profile: SkinProfile) {
        let mut profiles = self.profiles.write();
        profiles.insert(ProfileKey::Id(profile.id), profile.clone());
        profiles.insert(ProfileKey::Name(profile.name.clone()), profile);
    }
}

impl ProfileResolver for MemoryResolver {
    fn resolve(&self, key: &ProfileKey) -> BoxFuture<'static, Result<SkinProfile, SkinError>> {
        let result = self
            .profiles
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| SkinError::NotFound(key.to_string()));
        future::ready(result).boxed()
    }
}

/// Cached lookups with timeout and fallback
pub struct SkinService {
    resolver: Arc<dyn ProfileResolver>,
    cache: DashMap<ProfileKey, SkinTexture>,
    timeout: Duration,
    fallback: SkinTexture,
}

impl SkinService {
    /// Create a new skin service
    pub fn new(resolver: Arc<dyn ProfileResolver>, timeout: Duration, fallback_url: &str) -> Self {
        Self {
            resolver,
            cache: DashMap::new(),
            timeout,
            fallback: SkinTexture::new(fallback_url),
        }
    }

    /// Texture substituted for failed lookups
    pub fn fallback(&self) -> &SkinTexture {
        &self.fallback
    }

    /// Cached texture, if any
    pub fn cached(&self, key: &ProfileKey) -> Option<SkinTexture> {
        self.cache.get(key).map(|entry| entry.value().clone())
    }

    /// Drop a cached result so the next lookup asks the resolver again
    pub fn invalidate(&self, key: &ProfileKey) {
        self.cache.remove(key);
    }

    /// Resolve a texture.
    ///
    /// A failure or timeout is logged once and cached as the fallback, so the
    /// same profile is not retried on every request.
    pub async fn lookup(&self, key: ProfileKey) -> SkinTexture {
        if let Some(texture) = self.cached(&key) {
            return texture;
        }

        let texture = match tokio::time::timeout(self.timeout, self.resolver.resolve(&key)).await
        {
            Ok(Ok(profile)) => {
                debug!(profile = %key, url = %profile.texture.url, "Skin resolved");
                profile.texture
            }
            Ok(Err(e)) => {
                warn!(profile = %key, error = %e, "Skin lookup failed, using fallback");
                self.fallback.clone()
            }
            Err(_) => {
                warn!(profile = %key, error = %SkinError::Timeout, "Skin lookup failed, using fallback");
                self.fallback.clone()
            }
        };

        self.cache.insert(key, texture.clone());
        texture
    }
}

impl fmt::Debug for SkinService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkinService")
            .field("cached", &self.cache.len())
            .field("timeout", &self.timeout)
            .field("fallback", &self.fallback)
            .finish()
    }
}
