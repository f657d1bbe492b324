//! Configuration loader - host settings, scan configuration and named snapshots
//!
//! Host settings come from microscan.yaml (per hostname, like the other
//! machine-specific YAML files). The scan configuration is the JSON record the
//! control surface reads and writes; named snapshots live in `configs/` under
//! the data directory.

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use log::{debug, info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::{CameraSettings, ManualControls};

/// File name of the active scan configuration inside the data directory.
pub const SCAN_CONFIG_FILE: &str = "scan_config.json";
/// File name of the most recent calibration record inside the data directory.
pub const CALIBRATION_FILE: &str = "calibration.json";
/// Directory (inside the data directory) holding named configuration snapshots.
pub const CONFIGS_DIR: &str = "configs";

// -------------------- Host settings --------------------

/// Per-host machine settings from microscan.yaml.
///
/// Every key is optional in the YAML; missing keys keep the defaults below.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct HostSettings {
    pub moonraker_url: String,
    /// XY travel speed between grid points (mm/min)
    pub xy_speed: f64,
    /// Z speed used to reach the stack start (mm/min)
    pub z_approach_speed: f64,
    /// Z speed used to return to the stack start after a sweep (mm/min)
    pub z_return_speed: f64,
    /// Sweep speed used when the requested sweep duration is zero (mm/min)
    pub sweep_fallback_speed: f64,
    pub settle_ms: u64,
    /// Height above stack start used before the first XY move
    pub travel_lift_mm: f64,
    /// Height above stack start the head is lifted to when a run ends
    pub safe_lift_mm: f64,
    pub flush_timeout_secs: u64,
    pub capture_mode: CaptureMode,
    pub camera_vid_cmd: String,
    pub recording_bitrate: u32,
    pub ffmpeg_cmd: String,
    pub calibration_cmd: Vec<String>,
    pub data_dir: PathBuf,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            moonraker_url: "http://127.0.0.1:7125".to_string(),
            xy_speed: 5000.0,
            z_approach_speed: 1000.0,
            z_return_speed: 1800.0,
            sweep_fallback_speed: 1000.0,
            settle_ms: 200,
            travel_lift_mm: 2.0,
            safe_lift_mm: 5.0,
            flush_timeout_secs: 120,
            capture_mode: CaptureMode::Recording,
            camera_vid_cmd: "rpicam-vid".to_string(),
            recording_bitrate: 25_000_000,
            ffmpeg_cmd: "ffmpeg".to_string(),
            calibration_cmd: vec!["python3".to_string(), "calibrate.py".to_string()],
            data_dir: PathBuf::from("."),
        }
    }
}

impl HostSettings {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    pub fn scan_config_path(&self) -> PathBuf {
        self.data_dir.join(SCAN_CONFIG_FILE)
    }

    pub fn calibration_path(&self) -> PathBuf {
        self.data_dir.join(CALIBRATION_FILE)
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.data_dir.join(CONFIGS_DIR)
    }
}

/// Location of microscan.yaml: `MICROSCAN_CONFIG` if set, else next to Cargo.toml.
pub fn settings_path() -> PathBuf {
    match env::var("MICROSCAN_CONFIG") {
        Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
        _ => PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("microscan.yaml"),
    }
}

/// Load host settings for `hostname` from microscan.yaml.
///
/// A missing file or a missing host block falls back to defaults; a malformed
/// file is an error. `MOONRAKER_URL` from the environment (or .env) wins over YAML.
pub fn load_host_settings(hostname: &str) -> Result<HostSettings> {
    let _ = dotenv();
    let path = settings_path();
    let mut settings = if path.exists() {
        let file = File::open(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        let yaml: serde_yaml::Value = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        match find_host_block(&yaml, hostname) {
            Some(block) => serde_yaml::from_value::<HostSettings>(block.clone())
                .with_context(|| format!("Invalid host block for '{}' in {:?}", hostname, path))?,
            None => {
                warn!(target: "config_loader", "No host entry for '{}' in {:?}, using defaults", hostname, path);
                HostSettings::default()
            }
        }
    } else {
        warn!(target: "config_loader", "{:?} not found, using default host settings", path);
        HostSettings::default()
    };

    if let Ok(url) = env::var("MOONRAKER_URL") {
        debug!(target: "config_loader", "MOONRAKER_URL overridden from environment");
        settings.moonraker_url = url;
    }

    info!(target: "config_loader", "HostSettings: moonraker={}, data_dir={:?}, mode={:?} (hostname={})",
          settings.moonraker_url, settings.data_dir, settings.capture_mode, hostname);
    Ok(settings)
}

/// Load host settings for the machine we are running on.
pub fn load_local_host_settings() -> Result<HostSettings> {
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    load_host_settings(&hostname)
}

// Search across known OS sections to find a host block matching hostname
fn find_host_block<'a>(yaml: &'a serde_yaml::Value, hostname: &str) -> Option<&'a serde_yaml::Value> {
    for os_key in ["RaspberryPi", "Ubuntu", "macOS"].iter() {
        if let Some(os_map) = yaml.get(*os_key).and_then(|v| v.as_mapping()) {
            for (k, v) in os_map.iter() {
                if k.as_str() == Some(hostname) {
                    return Some(v);
                }
            }
        }
    }
    None
}

// -------------------- Scan configuration --------------------

/// How a focus stack is captured at each grid point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// One H.264 recording per point, converted to MP4 by the writer
    #[default]
    Recording,
    /// Frames held in memory during the sweep, written as JPEG
    Burst,
}

/// Scan configuration record, as exchanged with the control surface.
///
/// Numeric fields accept JSON numbers or numeric strings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    #[serde(deserialize_with = "lenient_f64")]
    pub start_x: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub start_y: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub end_x: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub end_y: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub step_size_x: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub step_size_y: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub stack_start_z: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub stack_end_z: f64,
    #[serde(deserialize_with = "lenient_u32")]
    pub stack_frames: u32,
    #[serde(deserialize_with = "lenient_f64")]
    pub framerate: f64,
    /// "WIDTHxHEIGHT", e.g. "4056x3040"
    pub resolution: String,
    #[serde(deserialize_with = "lenient_u32")]
    pub exposure_us: u32,
    #[serde(deserialize_with = "lenient_f64")]
    pub analogue_gain: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub awb_red: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub awb_blue: f64,
    pub sample_name: String,
    pub output_folder: PathBuf,
    /// Overrides the host's capture mode when present
    pub capture_mode: Option<CaptureMode>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            start_x: 0.0,
            start_y: 0.0,
            end_x: 10.0,
            end_y: 10.0,
            step_size_x: 5.0,
            step_size_y: 5.0,
            stack_start_z: 5.0,
            stack_end_z: 0.0,
            stack_frames: 150,
            framerate: 10.0,
            resolution: "4056x3040".to_string(),
            exposure_us: 50000,
            analogue_gain: 2.3540,
            awb_red: 2.1316,
            awb_blue: 3.3847,
            sample_name: "scan_001".to_string(),
            output_folder: PathBuf::from("/home/pi/camera/ssd/scans"),
            capture_mode: None,
        }
    }
}

/// Slowest frame rate a scan accepts (one frame per 100 s).
pub const MIN_FRAMERATE: f64 = 0.01;

impl ScanConfig {
    /// Reject configurations that must never reach the stage.
    pub fn validate(&self) -> Result<()> {
        let coords = [
            ("start_x", self.start_x), ("start_y", self.start_y),
            ("end_x", self.end_x), ("end_y", self.end_y),
            ("stack_start_z", self.stack_start_z), ("stack_end_z", self.stack_end_z),
        ];
        for (name, value) in coords {
            if !value.is_finite() {
                return Err(anyhow!("{} must be a finite number, got {}", name, value));
            }
        }
        for (name, step) in [("step_size_x", self.step_size_x), ("step_size_y", self.step_size_y)] {
            if !step.is_finite() || step == 0.0 {
                return Err(anyhow!("{} must be non-zero, got {}", name, step));
            }
        }
        if self.stack_frames == 0 {
            return Err(anyhow!("stack_frames must be positive"));
        }
        if !self.framerate.is_finite() || self.framerate < MIN_FRAMERATE {
            return Err(anyhow!("framerate must be at least {} fps, got {}", MIN_FRAMERATE, self.framerate));
        }
        self.resolution_size()?;
        validate_simple_name(&self.sample_name)
            .map_err(|e| anyhow!("sample_name: {}", e))?;
        Ok(())
    }

    /// Parse `resolution` ("W x H", case-insensitive separator).
    pub fn resolution_size(&self) -> Result<(u32, u32)> {
        parse_resolution(&self.resolution)
    }

    /// Folder all of this run's output goes into.
    pub fn run_dir(&self) -> PathBuf {
        self.output_folder.join(&self.sample_name)
    }

    pub fn capture_mode_or(&self, fallback: CaptureMode) -> CaptureMode {
        self.capture_mode.unwrap_or(fallback)
    }

    /// Manual controls configured in this record (used when no calibration exists).
    pub fn manual_controls(&self) -> ManualControls {
        ManualControls {
            exposure_us: self.exposure_us,
            analogue_gain: self.analogue_gain,
            colour_gains: (self.awb_red, self.awb_blue),
        }
    }

    /// Full camera settings for a scan with the given controls.
    pub fn camera_settings(&self, controls: ManualControls) -> Result<CameraSettings> {
        let (width, height) = self.resolution_size()?;
        Ok(CameraSettings {
            width,
            height,
            frame_rate: self.framerate,
            controls,
        })
    }
}

pub fn parse_resolution(text: &str) -> Result<(u32, u32)> {
    let lower = text.to_lowercase();
    let (w, h) = lower.split_once('x')
        .ok_or_else(|| anyhow!("Invalid resolution '{}', expected WIDTHxHEIGHT", text))?;
    let width: u32 = w.trim().parse()
        .map_err(|_| anyhow!("Invalid resolution width in '{}'", text))?;
    let height: u32 = h.trim().parse()
        .map_err(|_| anyhow!("Invalid resolution height in '{}'", text))?;
    if width == 0 || height == 0 {
        return Err(anyhow!("Resolution must be non-zero, got '{}'", text));
    }
    Ok((width, height))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => Ok(n),
        NumberOrText::Text(s) => s.trim().parse::<f64>().map_err(serde::de::Error::custom),
    }
}

fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    let value = lenient_f64(deserializer)?;
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        return Err(serde::de::Error::custom(format!("expected a non-negative integer, got {}", value)));
    }
    Ok(value as u32)
}

pub fn load_scan_config(path: &Path) -> Result<ScanConfig> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open scan config {:?}", path))?;
    let config: ScanConfig = serde_json::from_reader(file)
        .with_context(|| format!("Failed to parse scan config {:?}", path))?;
    Ok(config)
}

pub fn save_scan_config(path: &Path, config: &ScanConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json).with_context(|| format!("Failed to write scan config {:?}", path))?;
    Ok(())
}

// -------------------- Named snapshots --------------------

/// Snapshot names must be plain file names: no separators, no parent references.
pub fn validate_simple_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("Name must not be empty"));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(anyhow!("Invalid filename '{}' (contains path characters)", name));
    }
    Ok(())
}

/// Current scan configuration plus named snapshots under one data directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_settings(settings: &HostSettings) -> Self {
        Self::new(settings.data_dir.clone())
    }

    pub fn current_path(&self) -> PathBuf {
        self.root.join(SCAN_CONFIG_FILE)
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join(CONFIGS_DIR)
    }

    /// Current configuration, or the defaults when none has been saved yet.
    pub fn load_current(&self) -> Result<ScanConfig> {
        let path = self.current_path();
        if path.exists() {
            load_scan_config(&path)
        } else {
            Ok(ScanConfig::default())
        }
    }

    pub fn save_current(&self, config: &ScanConfig) -> Result<()> {
        save_scan_config(&self.current_path(), config)
    }

    pub fn save_named(&self, name: &str, config: &ScanConfig) -> Result<PathBuf> {
        validate_simple_name(name)?;
        let filename = if name.ends_with(".json") {
            name.to_string()
        } else {
            format!("{}.json", name)
        };
        let path = self.configs_dir().join(filename);
        save_scan_config(&path, config)?;
        info!(target: "config_loader", "Saved named config {:?}", path);
        Ok(path)
    }

    /// Names (with `.json`) of all saved snapshots, sorted.
    pub fn list_named(&self) -> Result<Vec<String>> {
        let dir = self.configs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to list {:?}", dir))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") && entry.path().is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn load_named(&self, name: &str) -> Result<ScanConfig> {
        validate_simple_name(name)?;
        let mut path = self.configs_dir().join(name);
        if !path.exists() && !name.ends_with(".json") {
            path = self.configs_dir().join(format!("{}.json", name));
        }
        if !path.exists() {
            return Err(anyhow!("Config '{}' not found", name));
        }
        load_scan_config(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        ScanConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_step_rejected() {
        let cfg = ScanConfig { step_size_y: 0.0, ..Default::default() };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("step_size_y"), "{}", err);
    }

    #[test]
    fn test_non_positive_frames_and_rate_rejected() {
        let cfg = ScanConfig { stack_frames: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = ScanConfig { framerate: 0.0, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = ScanConfig { framerate: -5.0, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = ScanConfig { framerate: 1e-30, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = ScanConfig { framerate: MIN_FRAMERATE, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_numeric_strings_accepted() {
        let json = r#"{"start_x": "1.5", "end_x": 20, "stack_frames": "90", "framerate": "30"}"#;
        let cfg: ScanConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.start_x, 1.5);
        assert_eq!(cfg.end_x, 20.0);
        assert_eq!(cfg.stack_frames, 90);
        assert_eq!(cfg.framerate, 30.0);
        // untouched fields keep defaults
        assert_eq!(cfg.step_size_x, 5.0);
    }

    #[test]
    fn test_fractional_frame_count_rejected() {
        let json = r#"{"stack_frames": 12.5}"#;
        assert!(serde_json::from_str::<ScanConfig>(json).is_err());
    }

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("4056x3040").unwrap(), (4056, 3040));
        assert_eq!(parse_resolution("1920 X 1080").unwrap(), (1920, 1080));
        assert!(parse_resolution("1920").is_err());
        assert!(parse_resolution("0x10").is_err());
    }

    #[test]
    fn test_simple_name_validation() {
        assert!(validate_simple_name("my_scan").is_ok());
        assert!(validate_simple_name("../etc/passwd").is_err());
        assert!(validate_simple_name("a/b").is_err());
        assert!(validate_simple_name("a\\b").is_err());
        assert!(validate_simple_name("").is_err());
    }

    #[test]
    fn test_named_snapshots_roundtrip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(store.list_named().unwrap().is_empty());

        let cfg = ScanConfig { sample_name: "slide_7".into(), ..Default::default() };
        let path = store.save_named("slide", &cfg).unwrap();
        assert!(path.ends_with("configs/slide.json"));
        store.save_named("another.json", &ScanConfig::default()).unwrap();
        fs::write(store.configs_dir().join("notes.txt"), "x").unwrap();

        assert_eq!(store.list_named().unwrap(), vec!["another.json", "slide.json"]);
        assert_eq!(store.load_named("slide.json").unwrap().sample_name, "slide_7");
        assert_eq!(store.load_named("slide").unwrap().sample_name, "slide_7");
        assert!(store.load_named("missing").is_err());
        assert!(store.save_named("../escape", &cfg).is_err());
        assert!(store.load_named("..").is_err());
    }

    #[test]
    fn test_current_config_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert_eq!(store.load_current().unwrap(), ScanConfig::default());
        let cfg = ScanConfig { end_x: 42.0, ..Default::default() };
        store.save_current(&cfg).unwrap();
        assert_eq!(store.load_current().unwrap().end_x, 42.0);
    }

    #[test]
    fn test_host_block_lookup() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            "Ubuntu:\n  lab-pi:\n    XY_SPEED: 3000\n    CAPTURE_MODE: burst\n",
        ).unwrap();
        let block = find_host_block(&yaml, "lab-pi").unwrap();
        let settings: HostSettings = serde_yaml::from_value(block.clone()).unwrap();
        assert_eq!(settings.xy_speed, 3000.0);
        assert_eq!(settings.capture_mode, CaptureMode::Burst);
        assert_eq!(settings.z_return_speed, 1800.0);
        assert!(find_host_block(&yaml, "other").is_none());
    }
}
