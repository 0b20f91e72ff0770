//! Daemon configuration: JSON file plus environment overrides.
//!
//! Precedence is file defaults, then file values, then environment
//! variables. `VISIOND_CONFIG` names the config file; without it the
//! built-in defaults apply.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::source::{CameraFacing, SessionConfig};
use crate::{
    DEFAULT_POOL_BUFFERS, DEFAULT_REQUESTED_FPS, DEFAULT_REQUESTED_HEIGHT,
    DEFAULT_REQUESTED_WIDTH,
};

const DEFAULT_DEVICE: &str = "stub://camera0";
const DEFAULT_STATS_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct VisiondConfigFile {
    device: Option<String>,
    session: Option<SessionConfigFile>,
    stats_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f32>,
    facing: Option<CameraFacing>,
    buffers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct VisiondConfig {
    pub device: String,
    pub session: SessionConfig,
    pub stats_interval: Duration,
}

impl VisiondConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VISIOND_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: VisiondConfigFile) -> Self {
        let session = file.session.unwrap_or_default();
        Self {
            device: file.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            session: SessionConfig {
                requested_width: session.width.unwrap_or(DEFAULT_REQUESTED_WIDTH),
                requested_height: session.height.unwrap_or(DEFAULT_REQUESTED_HEIGHT),
                requested_fps: session.fps.unwrap_or(DEFAULT_REQUESTED_FPS),
                facing: session.facing.unwrap_or(CameraFacing::Back),
                buffer_count: session.buffers.unwrap_or(DEFAULT_POOL_BUFFERS),
            },
            stats_interval: Duration::from_secs(
                file.stats_interval_secs.unwrap_or(DEFAULT_STATS_SECS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("VISIOND_DEVICE") {
            if !device.trim().is_empty() {
                self.device = device;
            }
        }
        if let Some(width) = parse_env("VISIOND_WIDTH")? {
            self.session.requested_width = width;
        }
        if let Some(height) = parse_env("VISIOND_HEIGHT")? {
            self.session.requested_height = height;
        }
        if let Some(fps) = parse_env("VISIOND_FPS")? {
            self.session.requested_fps = fps;
        }
        if let Some(buffers) = parse_env("VISIOND_BUFFERS")? {
            self.session.buffer_count = buffers;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.session.requested_width == 0 || self.session.requested_height == 0 {
            return Err(anyhow!("requested frame size must be non-zero"));
        }
        if self.session.requested_fps <= 0.0 {
            return Err(anyhow!("requested fps must be positive"));
        }
        if self.session.buffer_count == 0 {
            return Err(anyhow!("buffer count must be at least 1"));
        }
        if self.stats_interval.as_secs() == 0 {
            return Err(anyhow!("stats interval must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<VisiondConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{name} must be a valid number, got {value:?}")),
        _ => Ok(None),
    }
}
