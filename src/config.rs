use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SplitterConfig {
    /// Separators added closer than this to an existing one are ignored.
    pub separator_tolerance: u32,
    pub min_pitch: u32,
    pub max_pitch: u32,
    /// Slices awaited before the chapter is shown.
    pub initial_slices: usize,
    pub background_delay_ms: u64,
    /// Distance around the visible area at which a slice starts loading.
    pub proximity_margin: f64,
    pub overview_zoom: f64,
    pub export_format: String,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            separator_tolerance: 10,
            min_pitch: 4_000,
            max_pitch: 14_000,
            initial_slices: 1,
            background_delay_ms: 100,
            proximity_margin: 200.0,
            overview_zoom: 1.0,
            export_format: "webp".into(),
        }
    }
}

impl SplitterConfig {
    pub fn background_delay(&self) -> Duration {
        Duration::from_millis(self.background_delay_ms)
    }

    pub fn normalize(mut self) -> Self {
        self.separator_tolerance = self.separator_tolerance.max(1);
        if self.min_pitch > self.max_pitch {
            std::mem::swap(&mut self.min_pitch, &mut self.max_pitch);
        }
        if !self.proximity_margin.is_finite() || self.proximity_margin < 0.0 {
            self.proximity_margin = 0.0;
        }
        if !self.overview_zoom.is_finite() || self.overview_zoom < 1.0 {
            self.overview_zoom = 1.0;
        }
        let format = self
            .export_format
            .trim()
            .trim_start_matches('.')
            .to_ascii_lowercase();
        self.export_format = if format.is_empty() {
            Self::default().export_format
        } else {
            format
        };
        self
    }
}

pub fn load_splitter_config(path: &Path) -> io::Result<SplitterConfig> {
    let bytes = fs::read(path)?;
    serde_json::from_slice::<SplitterConfig>(&bytes)
        .map(SplitterConfig::normalize)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

pub fn save_splitter_config(path: &Path, config: &SplitterConfig) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(config)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    fs::write(path, json)
}

pub fn default_config_path(root: &Path) -> PathBuf {
    root.join("webtoon_splitter.json")
}
