//! In-memory `ImageService` used by the unit tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, Semaphore};

use crate::composite::CompositeDescription;
use crate::service::{ExportReport, ImageService, ServiceError};

#[derive(Default)]
struct MockState {
    description: Option<CompositeDescription>,
    fail_load: bool,
    failing_slices: HashSet<usize>,
    fail_full_image: bool,
    loads: Vec<PathBuf>,
    fetch_order: Vec<usize>,
    full_image_fetches: usize,
    exports: Vec<(Vec<u32>, String)>,
    fail_export: bool,
    panic_export: bool,
}

/// Holds fetches or exports until released.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    fn new() -> Self {
        Self(Arc::new(Semaphore::new(0)))
    }

    pub fn release(&self) {
        self.0.close();
    }

    async fn pass(&self) {
        // Acquire fails once the gate is closed.
        let _ = self.0.acquire().await;
    }
}

#[derive(Default)]
pub struct MockService {
    state: Mutex<MockState>,
    fetch_gate: Mutex<Option<Gate>>,
    export_gate: Mutex<Option<Gate>>,
    fetch_started: Notify,
}

impl MockService {
    pub fn with_heights(heights: &[u32]) -> Self {
        let pieces: Vec<(u32, u32)> = heights.iter().map(|&height| (800, height)).collect();
        Self::with_description(CompositeDescription::from_stack(800, &pieces))
    }

    pub fn with_description(description: CompositeDescription) -> Self {
        let service = Self::default();
        service.lock().description = Some(description);
        service
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state")
    }

    pub fn set_description(&self, description: CompositeDescription) {
        self.lock().description = Some(description);
    }

    pub fn fail_loads(&self, fail: bool) {
        self.lock().fail_load = fail;
    }

    pub fn fail_slice(&self, index: usize) {
        self.lock().failing_slices.insert(index);
    }

    pub fn heal_slice(&self, index: usize) {
        self.lock().failing_slices.remove(&index);
    }

    pub fn fail_full_image(&self, fail: bool) {
        self.lock().fail_full_image = fail;
    }

    pub fn fail_exports(&self, fail: bool) {
        self.lock().fail_export = fail;
    }

    pub fn panic_exports(&self, panic: bool) {
        self.lock().panic_export = panic;
    }

    pub fn hold_fetches(&self) -> Gate {
        let gate = Gate::new();
        *self.fetch_gate.lock().expect("fetch gate") = Some(gate.clone());
        gate
    }

    pub fn hold_exports(&self) -> Gate {
        let gate = Gate::new();
        *self.export_gate.lock().expect("export gate") = Some(gate.clone());
        gate
    }

    pub async fn wait_for_fetch_started(&self) {
        self.fetch_started.notified().await;
    }

    pub fn loads(&self) -> Vec<PathBuf> {
        self.lock().loads.clone()
    }

    pub fn fetch_order(&self) -> Vec<usize> {
        self.lock().fetch_order.clone()
    }

    pub fn slice_fetches(&self, index: usize) -> usize {
        self.lock()
            .fetch_order
            .iter()
            .filter(|&&fetched| fetched == index)
            .count()
    }

    pub fn full_image_fetches(&self) -> usize {
        self.lock().full_image_fetches
    }

    pub fn exports(&self) -> Vec<(Vec<u32>, String)> {
        self.lock().exports.clone()
    }
}

impl ImageService for MockService {
    async fn load_composite(&self, chapter_path: &Path) -> Result<CompositeDescription, ServiceError> {
        let mut state = self.lock();
        state.loads.push(chapter_path.to_path_buf());
        if state.fail_load {
            return Err(ServiceError::ChapterNotFound(chapter_path.to_path_buf()));
        }
        state.description.clone().ok_or(ServiceError::NotLoaded)
    }

    async fn fetch_slice_bytes(&self, index: usize) -> Result<Vec<u8>, ServiceError> {
        let gate = self.fetch_gate.lock().expect("fetch gate").clone();
        {
            let mut state = self.lock();
            state.fetch_order.push(index);
        }
        self.fetch_started.notify_one();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        let state = self.lock();
        if state.failing_slices.contains(&index) {
            return Err(ServiceError::Other(format!("slice {index} is corrupt")));
        }
        Ok(vec![index as u8; 4])
    }

    async fn fetch_full_image_bytes(&self) -> Result<Vec<u8>, ServiceError> {
        let mut state = self.lock();
        state.full_image_fetches += 1;
        if state.fail_full_image {
            return Err(ServiceError::NotSingleImage);
        }
        Ok(vec![0xff; 8])
    }

    async fn export_bands(
        &self,
        positions: Vec<u32>,
        format: String,
    ) -> Result<ExportReport, ServiceError> {
        let band_count = positions.len() + 1;
        let (fail, crash) = {
            let mut state = self.lock();
            state.exports.push((positions, format));
            (state.fail_export, state.panic_export)
        };
        if crash {
            panic!("exporter crashed");
        }

        let gate = self.export_gate.lock().expect("export gate").clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        if fail {
            return Err(ServiceError::Other("disk full".into()));
        }
        Ok(ExportReport {
            band_count,
            output_path: None,
        })
    }
}
