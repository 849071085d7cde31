//! Graph configuration.
//!
//! ## Eviction ceilings
//!
//! | Field | Resource class |
//! |-------|----------------|
//! | `max_sequences` | Sequences other than the one being kept |
//! | `max_unused_images` | Cache-initialized images not in the keep set |
//! | `max_unused_pre_stored_images` | Images never cache-initialized |
//! | `max_unused_tiles` | Cells not covering a kept image |
//!
//! The remaining fields tune request planning. Every field has a default, so a
//! JSON document only needs to name the values it overrides.

use serde::{Deserialize, Serialize};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document is not valid JSON for this schema.
    #[error("Invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    /// A field holds a value the graph cannot work with.
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },
}

/// Graph configuration. Immutable for the lifetime of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfiguration {
    /// Maximum number of retained sequences.
    pub max_sequences: usize,
    /// Maximum number of cache-initialized but idle images.
    pub max_unused_images: usize,
    /// Maximum number of images that were never cache-initialized.
    pub max_unused_pre_stored_images: usize,
    /// Maximum number of cells not covering a kept image.
    pub max_unused_tiles: usize,
    /// Radius in meters of the box whose covering cells make up an image's tiles.
    pub tile_threshold_meters: f64,
    /// Maximum ids per full-image batch when caching sequence images.
    pub sequence_batch_size: usize,
    /// Maximum ids per fill batch when caching a spatial area.
    pub spatial_batch_size: usize,
    /// Maximum batch fetches in flight for one operation.
    pub max_concurrent_batches: usize,
    /// Capacity of the change notification channel.
    pub event_capacity: usize,
}

impl Default for GraphConfiguration {
    fn default() -> Self {
        Self {
            max_sequences: 50,
            max_unused_images: 100,
            max_unused_pre_stored_images: 30,
            max_unused_tiles: 20,
            tile_threshold_meters: 20.0,
            sequence_batch_size: crate::batch::DEFAULT_BATCH_SIZE,
            spatial_batch_size: crate::batch::DEFAULT_BATCH_SIZE,
            max_concurrent_batches: 6,
            event_capacity: 256,
        }
    }
}

impl GraphConfiguration {
    /// Create a configuration with the four eviction ceilings and default tunables.
    pub fn with_limits(
        max_sequences: usize,
        max_unused_images: usize,
        max_unused_pre_stored_images: usize,
        max_unused_tiles: usize,
    ) -> Self {
        Self {
            max_sequences,
            max_unused_images,
            max_unused_pre_stored_images,
            max_unused_tiles,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every tunable is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("sequence_batch_size", self.sequence_batch_size),
            ("spatial_batch_size", self.spatial_batch_size),
            ("max_concurrent_batches", self.max_concurrent_batches),
            ("event_capacity", self.event_capacity),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }

        if !(self.tile_threshold_meters.is_finite() && self.tile_threshold_meters > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "tile_threshold_meters",
                reason: "must be a positive finite number",
            });
        }

        Ok(())
    }
}
