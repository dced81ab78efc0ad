//! Concurrent per-instance recipe cache.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::AtrainResult;
use crate::recipe::InterpRecipe;

/// Recipes are a pure function of the on-disk label locations, so they are
/// computed once per instance and shared across epochs and loader workers.
#[derive(Debug, Default)]
pub struct RecipeCache {
    entries: DashMap<u32, Arc<InterpRecipe>>,
}

impl RecipeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instance_id: u32) -> Option<Arc<InterpRecipe>> {
        self.entries
            .get(&instance_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Return the cached recipe, building and inserting it on first use.
    ///
    /// `build` runs outside the map lock; if two workers race on the same id
    /// the first inserted recipe wins.
    pub fn get_or_try_insert<F>(&self, instance_id: u32, build: F) -> AtrainResult<Arc<InterpRecipe>>
    where
        F: FnOnce() -> AtrainResult<InterpRecipe>,
    {
        if let Some(recipe) = self.get(instance_id) {
            return Ok(recipe);
        }

        let recipe = Arc::new(build()?);
        Ok(Arc::clone(
            self.entries.entry(instance_id).or_insert(recipe).value(),
        ))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
