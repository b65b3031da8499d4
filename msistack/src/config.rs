use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use msicore::algorithm::binning::DEFAULT_BIN_COUNT;
use msicore::algorithm::processing::ProcessingConfig;
use msicore::error::{MsiError, Result};

use crate::exchange::parameters::processing_config_from_text;

/// Settings of one registration orchestrator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Directory searched for the engines before `PATH` (also its `bin` subdirectory)
    pub search_path: Option<PathBuf>,
    /// Caller-owned working directory; a temporary one is used if absent
    pub working_directory: Option<PathBuf>,
    /// Remove the working directory when a run is done (default: true)
    pub remove_working_directory: bool,
    /// Upper bound for one engine run in seconds (default: unbounded)
    pub timeout_secs: Option<u64>,
    /// Registration stages, each inline parameter text or a path to a parameter file
    pub parameters: Vec<String>,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        RegistrationConfig {
            search_path: None,
            working_directory: None,
            remove_working_directory: true,
            timeout_secs: None,
            parameters: Vec::new(),
        }
    }
}

/// Settings of a slice stack and its ion-image queries
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Physical distance between adjacent slices (default: 1.0)
    pub spacing_z: f64,
    /// Number of bins of the global spectrum (default: 15000)
    pub bins: usize,
    /// Worker threads used per query (default: 8)
    pub threads: usize,
    pub processing: ProcessingConfig,
    pub registration: RegistrationConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            spacing_z: 1.0,
            bins: DEFAULT_BIN_COUNT,
            threads: 8,
            processing: ProcessingConfig::default(),
            registration: RegistrationConfig::default(),
        }
    }
}

impl StackConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MsiError::Config(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        StackConfig::from_json(&json).map_err(|e| MsiError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Replace the processing settings with those of a `(key value)` processing parameter file.
    pub fn load_processing_file(&mut self, path: &Path) -> Result<()> {
        self.processing = processing_config_from_text(&fs::read_to_string(path)?)?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| MsiError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msicore::algorithm::processing::Normalization;

    #[test]
    fn test_missing_fields_take_defaults() {
        let config = StackConfig::from_json(r#"{ "spacing_z": 12.5, "registration": { "timeout_secs": 60 } }"#).unwrap();
        assert_eq!(config.spacing_z, 12.5);
        assert_eq!(config.bins, 15000);
        assert_eq!(config.threads, 8);
        assert!(config.registration.remove_working_directory);
        assert_eq!(config.registration.timeout_secs, Some(60));
    }

    #[test]
    fn test_json_keeps_settings() {
        let mut config = StackConfig::default();
        config.processing.normalization = Normalization::Tic;
        config.registration.parameters = vec!["rigid.txt".to_string()];
        let parsed = StackConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_processing_file_overrides_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processing.txt");
        fs::write(&path, "(normalization \"TIC\")\n(smoothing-hw 5)\n").unwrap();

        let mut config = StackConfig::default();
        config.load_processing_file(&path).unwrap();
        assert_eq!(config.processing.normalization, Normalization::Tic);
        assert_eq!(config.processing.smoothing_half_window, 5);
        assert_eq!(config.processing.baseline_half_window, 50);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(StackConfig::from_json("{ bins: "), Err(MsiError::Config(_))));
    }
}
