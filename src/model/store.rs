//! Loaded skeletons keyed by model name

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::bone::Skeleton;

/// Concurrent name → skeleton map.
///
/// Trackers hold their own `Arc<Skeleton>`, so replacing an entry never
/// disturbs a model that is already rendering.
#[derive(Debug, Default)]
pub struct ModelStore {
    models: DashMap<String, Arc<Skeleton>>,
}

impl ModelStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace one skeleton
    pub fn insert(&self, skeleton: Skeleton) -> Arc<Skeleton> {
        let skeleton = Arc::new(skeleton);
        self.models
            .insert(skeleton.name().to_string(), Arc::clone(&skeleton));
        skeleton
    }

    /// Get a skeleton by model name
    pub fn get(&self, name: &str) -> Option<Arc<Skeleton>> {
        self.models.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a skeleton
    pub fn remove(&self, name: &str) -> Option<Arc<Skeleton>> {
        self.models.remove(name).map(|(_, skeleton)| skeleton)
    }

    /// Replace the whole set after a reload
    pub fn replace_all(&self, skeletons: Vec<Skeleton>) -> usize {
        let loaded = skeletons.len();
        let names: Vec<String> = skeletons.iter().map(|s| s.name().to_string()).collect();
        for skeleton in skeletons {
            self.insert(skeleton);
        }
        self.models.retain(|name, _| names.contains(name));
        info!(models = loaded, "Model store replaced");
        loaded
    }

    /// Names of every loaded model
    pub fn names(&self) -> Vec<String> {
        self.models.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of loaded models
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether no model is loaded
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::bone::{BoneSpec, SkeletonBuilder};

    fn skeleton(name: &str) -> Skeleton {
        SkeletonBuilder::new(name)
            .bone(BoneSpec::new("root"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let store = ModelStore::new();
        assert!(store.is_empty());
        store.insert(skeleton("golem"));
        assert_eq!(store.get("golem").unwrap().name(), "golem");
        assert!(store.get("dragon").is_none());
    }

    #[test]
    fn test_replace_all_keeps_existing_handles() {
        let store = ModelStore::new();
        store.insert(skeleton("golem"));
        store.insert(skeleton("old"));
        let held = store.get("golem").unwrap();

        let loaded = store.replace_all(vec![skeleton("golem"), skeleton("dragon")]);
        assert_eq!(loaded, 2);
        assert_eq!(store.len(), 2);
        assert!(store.get("old").is_none());
        // The old handle stays valid but is no longer the stored one
        assert!(!Arc::ptr_eq(&held, &store.get("golem").unwrap()));
        assert_eq!(held.name(), "golem");
    }
}
