//! Configuration management for the visualization daemon
//!
//! Settings live in a TOML file; every key is optional and falls back to
//! its default.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vis_core::{AudioFormat, Error, SampleFormat};
use visualization::AnalysisParameters;

/// Daemon settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the visualization server listens on
    pub bind_to_address: String,

    /// Port the visualization server listens on
    pub port: u16,

    /// Most clients served at once; 0 means no limit
    pub max_clients: usize,

    /// How much recently played audio is kept for analysis, in ms
    pub cache_duration_ms: u64,

    /// Frames per analysis window
    pub num_samples: usize,

    /// Lowest frequency reported to clients, in Hz
    pub lo_cutoff: f32,

    /// Highest frequency reported to clients, in Hz
    pub hi_cutoff: f32,

    /// How often closed client sessions are cleaned up, in ms
    pub reap_interval_ms: u64,

    /// Format of the played audio, as `rate:bits:channels`
    pub audio_format: AudioFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_to_address: "0.0.0.0".to_string(),
            port: 8001,
            max_clients: 0,
            cache_duration_ms: 2000,
            num_samples: AnalysisParameters::DEFAULT_NUM_SAMPLES,
            lo_cutoff: AnalysisParameters::DEFAULT_LO_CUTOFF,
            hi_cutoff: AnalysisParameters::DEFAULT_HI_CUTOFF,
            reap_interval_ms: 3000,
            audio_format: AudioFormat::new(44100, SampleFormat::S16, 2),
        }
    }
}

impl Settings {
    /// Validated analysis settings
    pub fn analysis_parameters(&self) -> Result<AnalysisParameters, Error> {
        AnalysisParameters::new(self.num_samples, self.lo_cutoff, self.hi_cutoff)
            .map_err(|e| Error::Config(format!("Invalid analysis settings: {}", e)))
    }

    pub fn listen_address(&self) -> Result<SocketAddr, Error> {
        let ip: IpAddr = self.bind_to_address.parse().map_err(|e| {
            Error::Config(format!(
                "Invalid bind_to_address '{}': {}",
                self.bind_to_address, e
            ))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn cache_duration(&self) -> Duration {
        Duration::from_millis(self.cache_duration_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Configuration manager
pub struct ConfigManager {
    settings: Settings,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Load settings from the user's config directory, or use defaults
    pub fn new() -> Result<Self, Error> {
        let mut config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Failed to determine config directory".to_string()))?;
        config_dir.push("visd");

        Self::with_file(config_dir.join("config.toml"))
    }

    /// Load settings from `path`; a missing file means defaults
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config_file = path.as_ref().to_path_buf();
        let settings = if config_file.exists() {
            let settings = Self::load_from_file(&config_file)?;
            info!("Loaded config from {:?}", config_file);
            settings
        } else {
            debug!("Config file {:?} not found, using defaults", config_file);
            Settings::default()
        };

        Ok(Self {
            settings,
            config_file,
        })
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Settings, Error> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Write the current settings to the config file
    pub fn save(&self) -> Result<(), Error> {
        let toml = toml::to_string_pretty(&self.settings)
            .map_err(|e| Error::Config(format!("Failed to serialize settings: {}", e)))?;

        if let Some(parent) = self.config_file.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        fs::write(&self.config_file, toml)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        debug!("Saved config to {:?}", self.config_file);
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }
}
