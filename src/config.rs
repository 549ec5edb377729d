//! Configuration management for warpcache

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::extent::Extent;
use crate::pool::DEFAULT_COMPRESSION_LEVEL;
use crate::spatial_index::{DEFAULT_THRESHOLD, MINIMAL_THRESHOLD};

/// Radial lens distortion used as the expensive model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistortionConfig {
    pub center_x: f64,
    pub center_y: f64,
    pub k1: f64,
    pub k2: f64,
    /// Radius at which the normalized distance is 1
    pub normalization_radius: f64,
    /// Conversions farther than this from the center fail
    #[serde(default)]
    pub valid_radius: Option<f64>,
}

impl Default for DistortionConfig {
    fn default() -> Self {
        Self {
            center_x: 320.0,
            center_y: 240.0,
            k1: 0.08,
            k2: -0.01,
            normalization_radius: 400.0,
            valid_radius: None,
        }
    }
}

/// Cell size and cached window shape of the grid adapter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GridAdapterConfig {
    pub direct_step: f64,
    pub inverse_step: f64,
    /// Rows of cells kept in each cached window
    pub rows: usize,
    pub columns: usize,
}

impl Default for GridAdapterConfig {
    fn default() -> Self {
        Self {
            direct_step: 16.0,
            inverse_step: 16.0,
            rows: 8,
            columns: 8,
        }
    }
}

/// Facet model creation settings of the mesh adapter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MeshAdapterConfig {
    /// Facets whose converted area is at most this fraction of their source
    /// area are dropped
    pub degenerate_epsilon: f64,
    /// Split threshold of the facet indexes
    pub split_threshold: usize,
}

impl Default for MeshAdapterConfig {
    fn default() -> Self {
        Self {
            degenerate_epsilon: 1e-9,
            split_threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Mesh laid over the study area
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshConfig {
    pub rows: usize,
    pub columns: usize,
    /// Split every quad into two triangles fitted with affine models
    #[serde(default)]
    pub triangulated: bool,
    #[serde(default)]
    pub adapter: MeshAdapterConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            rows: 12,
            columns: 16,
            triangulated: false,
            adapter: MeshAdapterConfig::default(),
        }
    }
}

/// Area sampled by the precision studies and warped by the benchmark
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudyConfig {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
    pub step: f64,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            x_min: 0.0,
            y_min: 0.0,
            x_max: 640.0,
            y_max: 480.0,
            step: 8.0,
        }
    }
}

impl StudyConfig {
    pub fn area(&self) -> Extent {
        Extent::new(self.x_min, self.y_min, self.x_max, self.y_max)
    }
}

/// Budget of the pool holding warped image rows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Bytes kept inflated across all rows
    pub count_limit: usize,
    pub compression_level: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            count_limit: 256 * 1024,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub distortion: DistortionConfig,

    #[serde(default)]
    pub grid: GridAdapterConfig,

    #[serde(default)]
    pub mesh: MeshConfig,

    #[serde(default)]
    pub study: StudyConfig,

    #[serde(default)]
    pub pool: PoolConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            config
                .validate()
                .with_context(|| format!("Invalid configuration in {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.distortion.normalization_radius > 0.0,
            "distortion.normalization_radius must be positive"
        );
        ensure!(
            self.grid.direct_step > 0.0 && self.grid.inverse_step > 0.0,
            "grid steps must be positive"
        );
        ensure!(
            self.grid.rows > 0 && self.grid.columns > 0,
            "grid window needs at least one cell"
        );
        ensure!(
            self.mesh.rows > 0 && self.mesh.columns > 0,
            "mesh needs at least one facet"
        );
        ensure!(
            self.mesh.adapter.split_threshold >= MINIMAL_THRESHOLD,
            "mesh.adapter.split_threshold must be at least {}",
            MINIMAL_THRESHOLD
        );
        ensure!(
            self.study.x_max > self.study.x_min && self.study.y_max > self.study.y_min,
            "study area is empty"
        );
        ensure!(self.study.step > 0.0, "study.step must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.study.area().width(), 640.0);
        assert_eq!(config.mesh.adapter.split_threshold, DEFAULT_THRESHOLD);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [grid]
            direct_step = 4.0
            inverse_step = 8.0
            rows = 2
            columns = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.grid.columns, 3);
        assert_eq!(config.distortion, DistortionConfig::default());
        assert!(!config.mesh.triangulated);
    }

    #[test]
    fn test_invalid_step_rejected() {
        let mut config = Config::default();
        config.grid.inverse_step = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("warpcache-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        let mut config = Config::default();
        config.distortion.valid_radius = Some(350.0);
        config.mesh.triangulated = true;
        config.save(&path).unwrap();

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded, config);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
