//! Video Output Configuration
//!
//! Persisted as JSON. Settings that depend on the picture format are kept
//! per resolution bucket; everything else is global to the output session.

use crate::geometry::{CutMargins, ZoomMode, ZoomModes};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid geometry '{0}'")]
    Geometry(String),
}

// ============================================================================
// Resolution Buckets
// ============================================================================

/// Video format class selecting per-format settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionBucket {
    Sd576i,
    Hd720p,
    /// 1280x1080 / 1440x1080 interlaced
    Fake1080i,
    Hd1080i,
    Uhd,
}

impl ResolutionBucket {
    pub const COUNT: usize = 5;
    pub const ALL: [ResolutionBucket; Self::COUNT] = [
        ResolutionBucket::Sd576i,
        ResolutionBucket::Hd720p,
        ResolutionBucket::Fake1080i,
        ResolutionBucket::Hd1080i,
        ResolutionBucket::Uhd,
    ];

    pub fn classify(width: u32, height: u32) -> Self {
        match height {
            0..=576 => ResolutionBucket::Sd576i,
            577..=720 => ResolutionBucket::Hd720p,
            721..=1088 if width < 1920 => ResolutionBucket::Fake1080i,
            721..=1088 => ResolutionBucket::Hd1080i,
            _ => ResolutionBucket::Uhd,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ResolutionBucket::Sd576i => "576i",
            ResolutionBucket::Hd720p => "720p",
            ResolutionBucket::Fake1080i => "fake-1080i",
            ResolutionBucket::Hd1080i => "1080i",
            ResolutionBucket::Uhd => "UHD",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeinterlaceMode {
    #[default]
    Bob,
    Weave,
    Temporal,
    TemporalSpatial,
    SoftBob,
    SoftSpatial,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    #[default]
    Normal,
    Fast,
    HighQuality,
    Anamorphic,
}

/// When a starved decoder gets a black frame instead of a stale picture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlackPicture {
    Off,
    /// Only once the stream has been closed and drained
    #[default]
    AfterClose,
    Always,
}

pub const DENOISE_MAX: i32 = 1000;
pub const SHARPEN_MAX: i32 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketSettings {
    pub deinterlace: DeinterlaceMode,
    pub skip_chroma_deinterlace: bool,
    pub inverse_telecine: bool,
    /// 0..=1000
    pub denoise: i32,
    /// -1000..=1000
    pub sharpen: i32,
    pub scaling: ScalingMode,
    pub cut_top_bottom: i32,
    pub cut_left_right: i32,
}

impl BucketSettings {
    fn sanitize(&mut self) {
        self.denoise = self.denoise.clamp(0, DENOISE_MAX);
        self.sharpen = self.sharpen.clamp(-SHARPEN_MAX, SHARPEN_MAX);
        self.cut_top_bottom = self.cut_top_bottom.max(0);
        self.cut_left_right = self.cut_left_right.max(0);
    }
}

// ============================================================================
// Window Geometry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowGeometry {
    fn default() -> Self {
        Self { x: 0, y: 0, width: 1920, height: 1080 }
    }
}

impl WindowGeometry {
    /// Parse `[=][WIDTHxHEIGHT][{+-}X{+-}Y]`. Missing parts keep defaults.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::Geometry(spec.to_string());
        let text = spec.trim();
        let text = text.strip_prefix('=').unwrap_or(text);
        if text.is_empty() {
            return Err(invalid());
        }

        let mut geometry = WindowGeometry::default();
        let signs = &['+', '-'][..];
        let (size, position) = match text.find(signs) {
            Some(i) => text.split_at(i),
            None => (text, ""),
        };

        if !size.is_empty() {
            let (w, h) = size.split_once(&['x', 'X'][..]).ok_or_else(invalid)?;
            geometry.width = w.parse().map_err(|_| invalid())?;
            geometry.height = h.parse().map_err(|_| invalid())?;
            if geometry.width == 0 || geometry.height == 0 {
                return Err(invalid());
            }
        }

        if !position.is_empty() {
            let split = position[1..].find(signs).map(|i| i + 1).ok_or_else(invalid)?;
            let (x, y) = position.split_at(split);
            geometry.x = x.parse().map_err(|_| invalid())?;
            geometry.y = y.parse().map_err(|_| invalid())?;
        }

        Ok(geometry)
    }
}

// ============================================================================
// Video Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Output module name, `None` picks the first available
    pub driver: Option<String>,
    /// X-style geometry string for the output window
    pub geometry: Option<String>,
    /// Indexed by `ResolutionBucket::index`
    pub buckets: [BucketSettings; ResolutionBucket::COUNT],
    pub zoom_4_3: ZoomMode,
    pub zoom_other: ZoomMode,
    pub soft_start_sync: bool,
    pub black_picture: BlackPicture,
    pub sixty_hz_mode: bool,
    /// Audio/video offset in milliseconds, positive delays audio
    pub audio_delay_ms: i32,
    pub studio_levels: bool,
    pub background_rgba: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            driver: None,
            geometry: None,
            buckets: [BucketSettings::default(); ResolutionBucket::COUNT],
            zoom_4_3: ZoomMode::Normal,
            zoom_other: ZoomMode::Normal,
            soft_start_sync: true,
            black_picture: BlackPicture::AfterClose,
            sixty_hz_mode: false,
            audio_delay_ms: 0,
            studio_levels: false,
            background_rgba: 0x0000_00ff,
        }
    }
}

impl VideoConfig {
    /// `<config dir>/framepace/config.json`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("framepace");
        path.push("config.json");
        path
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: VideoConfig = serde_json::from_str(&content)?;
        config.sanitize();
        tracing::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Load from `path` or the default location; a missing file yields
    /// defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if !path.exists() {
            tracing::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io { path: path.to_path_buf(), source };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_err)
    }

    pub fn sanitize(&mut self) {
        for bucket in &mut self.buckets {
            bucket.sanitize();
        }
    }

    pub fn bucket(&self, bucket: ResolutionBucket) -> &BucketSettings {
        &self.buckets[bucket.index()]
    }

    pub fn bucket_mut(&mut self, bucket: ResolutionBucket) -> &mut BucketSettings {
        &mut self.buckets[bucket.index()]
    }

    pub fn cut_margins(&self, bucket: ResolutionBucket) -> CutMargins {
        let settings = self.bucket(bucket);
        CutMargins {
            top_bottom: settings.cut_top_bottom,
            left_right: settings.cut_left_right,
        }
    }

    pub fn zoom_modes(&self) -> ZoomModes {
        ZoomModes { four_three: self.zoom_4_3, other: self.zoom_other }
    }

    /// Audio delay in 90 kHz ticks
    pub fn audio_delay_ticks(&self) -> i64 {
        self.audio_delay_ms as i64 * crate::clock::TICKS_PER_MS
    }

    pub fn window_geometry(&self) -> Result<WindowGeometry, ConfigError> {
        match &self.geometry {
            Some(text) => WindowGeometry::parse(text),
            None => Ok(WindowGeometry::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_classification() {
        assert_eq!(ResolutionBucket::classify(720, 576), ResolutionBucket::Sd576i);
        assert_eq!(ResolutionBucket::classify(704, 480), ResolutionBucket::Sd576i);
        assert_eq!(ResolutionBucket::classify(1280, 720), ResolutionBucket::Hd720p);
        assert_eq!(ResolutionBucket::classify(1440, 1080), ResolutionBucket::Fake1080i);
        assert_eq!(ResolutionBucket::classify(1920, 1080), ResolutionBucket::Hd1080i);
        assert_eq!(ResolutionBucket::classify(1920, 1088), ResolutionBucket::Hd1080i);
        assert_eq!(ResolutionBucket::classify(3840, 2160), ResolutionBucket::Uhd);
    }

    #[test]
    fn test_geometry_parse() {
        let g = WindowGeometry::parse("1280x720+10+20").unwrap();
        assert_eq!(g, WindowGeometry { x: 10, y: 20, width: 1280, height: 720 });

        let g = WindowGeometry::parse("=800X600").unwrap();
        assert_eq!((g.width, g.height, g.x, g.y), (800, 600, 0, 0));

        let g = WindowGeometry::parse("-5+7").unwrap();
        assert_eq!((g.width, g.height, g.x, g.y), (1920, 1080, -5, 7));

        assert!(WindowGeometry::parse("").is_err());
        assert!(WindowGeometry::parse("axb").is_err());
        assert!(WindowGeometry::parse("0x100").is_err());
        assert!(WindowGeometry::parse("100x100+5").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = VideoConfig::default();
        assert!(config.soft_start_sync);
        assert_eq!(config.black_picture, BlackPicture::AfterClose);
        assert!(!config.sixty_hz_mode);
        assert_eq!(config.window_geometry().unwrap(), WindowGeometry::default());
    }

    #[test]
    fn test_load_clamps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "audio_delay_ms": 40,
                "zoom_4_3": "center_cut_out",
                "buckets": [
                    {"denoise": 5000, "sharpen": -4000, "cut_top_bottom": -3},
                    {}, {}, {}, {"sharpen": 200}
                ]
            }"#,
        )
        .unwrap();

        let config = VideoConfig::load(&path).unwrap();
        let sd = config.bucket(ResolutionBucket::Sd576i);
        assert_eq!(sd.denoise, 1000);
        assert_eq!(sd.sharpen, -1000);
        assert_eq!(sd.cut_top_bottom, 0);
        assert_eq!(config.bucket(ResolutionBucket::Uhd).sharpen, 200);
        assert_eq!(config.zoom_4_3, ZoomMode::CenterCutOut);
        assert_eq!(config.audio_delay_ticks(), 40 * 90);
        // untouched fields keep defaults
        assert!(config.soft_start_sync);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = VideoConfig::default();
        config.driver = Some("noop".into());
        config.bucket_mut(ResolutionBucket::Hd720p).cut_left_right = 16;
        config.save(&path).unwrap();

        let loaded = VideoConfig::load_or_default(Some(path.as_path())).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.cut_margins(ResolutionBucket::Hd720p).left_right, 16);
    }

    #[test]
    fn test_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = VideoConfig::load_or_default(Some(dir.path().join("absent.json").as_path())).unwrap();
        assert_eq!(config, VideoConfig::default());
    }

    #[test]
    fn test_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(VideoConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
