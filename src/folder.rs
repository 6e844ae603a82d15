//! `ImageService` backed by a chapter folder on disk.
//!
//! A chapter folder holds its source strips in `Raw/`. Each source file becomes
//! one slice of the composite; only image headers are read while describing the
//! chapter. Exporting writes a band plan to `Split/split-plan.json` that maps
//! every output page onto the source rows that make it up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use natord::compare;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::composite::CompositeDescription;
use crate::service::{ExportReport, ImageService, ServiceError};

const SUPPORTED_SOURCE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];
pub const RAW_DIRECTORY: &str = "Raw";
pub const SPLIT_DIRECTORY: &str = "Split";
pub const SPLIT_PLAN_FILE: &str = "split-plan.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceImage {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub start_y: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandSource {
    pub source: PathBuf,
    pub source_y: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandPlan {
    pub file_name: String,
    pub start_y: u32,
    pub end_y: u32,
    pub sources: Vec<BandSource>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitPlan {
    pub generated_at: String,
    pub chapter: PathBuf,
    pub format: String,
    pub total_width: u32,
    pub total_height: u32,
    pub bands: Vec<BandPlan>,
}

#[derive(Debug)]
struct LoadedChapter {
    root: PathBuf,
    width: u32,
    total_height: u32,
    sources: Vec<SourceImage>,
}

impl LoadedChapter {
    fn describe(&self) -> CompositeDescription {
        let pieces: Vec<(u32, u32)> = self
            .sources
            .iter()
            .map(|source| (source.width, source.height))
            .collect();
        CompositeDescription::from_stack(self.width, &pieces)
    }
}

pub struct FolderImageService {
    raw_directory: String,
    split_directory: String,
    chapter: Mutex<Option<Arc<LoadedChapter>>>,
}

impl Default for FolderImageService {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderImageService {
    pub fn new() -> Self {
        Self {
            raw_directory: RAW_DIRECTORY.to_string(),
            split_directory: SPLIT_DIRECTORY.to_string(),
            chapter: Mutex::new(None),
        }
    }

    pub fn with_directories(raw: impl Into<String>, split: impl Into<String>) -> Self {
        Self {
            raw_directory: raw.into(),
            split_directory: split.into(),
            chapter: Mutex::new(None),
        }
    }

    async fn current(&self) -> Result<Arc<LoadedChapter>, ServiceError> {
        self.chapter.lock().await.clone().ok_or(ServiceError::NotLoaded)
    }

    async fn source(&self, index: usize) -> Result<PathBuf, ServiceError> {
        let chapter = self.current().await?;
        chapter
            .sources
            .get(index)
            .map(|source| source.path.clone())
            .ok_or(ServiceError::SliceOutOfRange(index))
    }
}

fn is_supported_source(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_SOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn collect_sources(raw: &Path) -> Result<Vec<PathBuf>, ServiceError> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(raw)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = entry.map_err(|err| ServiceError::Other(err.to_string()))?;
        if entry.file_type().is_file() && is_supported_source(entry.path()) {
            entries.push(entry.into_path());
        }
    }

    entries.sort_by(|a, b| {
        let a_name = a.file_name().map(|name| name.to_string_lossy()).unwrap_or_default();
        let b_name = b.file_name().map(|name| name.to_string_lossy()).unwrap_or_default();
        compare(&a_name, &b_name)
    });
    Ok(entries)
}

fn scan_chapter(root: &Path, raw_directory: &str) -> Result<LoadedChapter, ServiceError> {
    let raw = root.join(raw_directory);
    if !raw.is_dir() {
        return Err(ServiceError::ChapterNotFound(raw));
    }

    let mut sources = Vec::new();
    let mut width = 0u32;
    let mut total_height = 0u32;
    for path in collect_sources(&raw)? {
        let (w, h) = image::image_dimensions(&path)?;
        if sources.is_empty() {
            width = w;
        } else if w != width {
            return Err(ServiceError::WidthMismatch {
                path,
                expected: width,
                found: w,
            });
        }
        debug!(path = %path.display(), width = w, height = h, "source image found");
        sources.push(SourceImage {
            path,
            width: w,
            height: h,
            start_y: total_height,
        });
        total_height += h;
    }

    if sources.is_empty() {
        return Err(ServiceError::NoImages(raw));
    }

    Ok(LoadedChapter {
        root: root.to_path_buf(),
        width,
        total_height,
        sources,
    })
}

/// Maps cut positions onto output pages and the source rows covering each.
pub fn plan_bands(
    sources: &[SourceImage],
    positions: &[u32],
    total_height: u32,
    format: &str,
) -> Vec<BandPlan> {
    let mut cuts: Vec<u32> = positions
        .iter()
        .map(|&position| position.min(total_height))
        .collect();
    cuts.sort_unstable();
    cuts.dedup();
    if cuts.last() != Some(&total_height) {
        cuts.push(total_height);
    }

    let mut bands = Vec::with_capacity(cuts.len());
    let mut start_y = 0u32;
    for end_y in cuts {
        if end_y <= start_y {
            continue;
        }
        let covering = sources
            .iter()
            .filter_map(|source| {
                let source_end = source.start_y + source.height;
                let from = start_y.max(source.start_y);
                let to = end_y.min(source_end);
                (from < to).then(|| BandSource {
                    source: source.path.clone(),
                    source_y: from - source.start_y,
                    height: to - from,
                })
            })
            .collect();
        bands.push(BandPlan {
            file_name: format!("{}.{}", bands.len() + 1, format),
            start_y,
            end_y,
            sources: covering,
        });
        start_y = end_y;
    }
    bands
}

fn write_split_plan(
    chapter: &LoadedChapter,
    split_directory: &str,
    positions: &[u32],
    format: &str,
) -> Result<ExportReport, ServiceError> {
    let bands = plan_bands(&chapter.sources, positions, chapter.total_height, format);
    let plan = SplitPlan {
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        chapter: chapter.root.clone(),
        format: format.to_string(),
        total_width: chapter.width,
        total_height: chapter.total_height,
        bands,
    };

    let split_dir = chapter.root.join(split_directory);
    std::fs::create_dir_all(&split_dir)?;
    let output_path = split_dir.join(SPLIT_PLAN_FILE);
    std::fs::write(&output_path, serde_json::to_vec_pretty(&plan)?)?;

    Ok(ExportReport {
        band_count: plan.bands.len(),
        output_path: Some(output_path),
    })
}

impl ImageService for FolderImageService {
    async fn load_composite(&self, chapter_path: &Path) -> Result<CompositeDescription, ServiceError> {
        let root = chapter_path.to_path_buf();
        let raw_directory = self.raw_directory.clone();
        let chapter = tokio::task::spawn_blocking(move || scan_chapter(&root, &raw_directory))
            .await
            .map_err(|err| ServiceError::Task(err.to_string()))??;

        let description = chapter.describe();
        info!(
            chapter = %chapter.root.display(),
            sources = chapter.sources.len(),
            height = chapter.total_height,
            "chapter scanned"
        );
        *self.chapter.lock().await = Some(Arc::new(chapter));
        Ok(description)
    }

    async fn fetch_slice_bytes(&self, index: usize) -> Result<Vec<u8>, ServiceError> {
        let path = self.source(index).await?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn fetch_full_image_bytes(&self) -> Result<Vec<u8>, ServiceError> {
        let chapter = self.current().await?;
        match chapter.sources.as_slice() {
            [only] => Ok(tokio::fs::read(&only.path).await?),
            _ => Err(ServiceError::NotSingleImage),
        }
    }

    async fn export_bands(
        &self,
        positions: Vec<u32>,
        format: String,
    ) -> Result<ExportReport, ServiceError> {
        let chapter = self.current().await?;
        let split_directory = self.split_directory.clone();
        tokio::task::spawn_blocking(move || {
            write_split_plan(&chapter, &split_directory, &positions, &format)
        })
        .await
        .map_err(|err| ServiceError::Task(err.to_string()))?
    }
}
