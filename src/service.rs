use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::composite::CompositeDescription;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("chapter folder not found: {}", .0.display())]
    ChapterNotFound(PathBuf),
    #[error("no supported images found in {}", .0.display())]
    NoImages(PathBuf),
    #[error("all images must share one width: {} is {found}px wide, expected {expected}px", .path.display())]
    WidthMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },
    #[error("no chapter is loaded")]
    NotLoaded,
    #[error("slice {0} does not exist")]
    SliceOutOfRange(usize),
    #[error("chapter is made of several images")]
    NotSingleImage,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Task(String),
    #[error("{0}")]
    Other(String),
}

/// What the exporter reports once a band export completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    pub band_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

/// Backend collaborator: decodes, enumerates and writes images on behalf of the
/// session. Every call may suspend.
pub trait ImageService: Send + Sync + 'static {
    fn load_composite(
        &self,
        chapter_path: &Path,
    ) -> impl Future<Output = Result<CompositeDescription, ServiceError>> + Send;

    fn fetch_slice_bytes(
        &self,
        index: usize,
    ) -> impl Future<Output = Result<Vec<u8>, ServiceError>> + Send;

    fn fetch_full_image_bytes(&self) -> impl Future<Output = Result<Vec<u8>, ServiceError>> + Send;

    fn export_bands(
        &self,
        positions: Vec<u32>,
        format: String,
    ) -> impl Future<Output = Result<ExportReport, ServiceError>> + Send;
}
