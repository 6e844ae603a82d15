use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::composite::{validate_slices, InvalidSpecError, SliceSpec};
use crate::events::{publish, EventSender, SessionEvent};
use crate::service::{ImageService, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

/// Shared handle to the encoded bytes of a loaded slice.
#[derive(Clone)]
pub struct PixelHandle(Arc<[u8]>);

impl PixelHandle {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn same_as(&self, other: &PixelHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PixelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PixelHandle({} bytes)", self.0.len())
    }
}

#[derive(Debug, Clone)]
pub struct Slice {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub start_y: u32,
    pub end_y: u32,
    pub state: LoadState,
    pub pixels: Option<PixelHandle>,
}

impl Slice {
    fn from_spec(spec: &SliceSpec) -> Self {
        Self {
            index: spec.index,
            width: spec.width,
            height: spec.height,
            start_y: spec.start_y,
            end_y: spec.end_y,
            state: LoadState::Unloaded,
            pixels: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state == LoadState::Loaded
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidSpec(#[from] InvalidSpecError),
    #[error("slice {0} does not exist")]
    UnknownSlice(usize),
    #[error("failed to fetch slice {index}: {source}")]
    SliceFetch {
        index: usize,
        #[source]
        source: ServiceError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    AlreadyLoaded,
    InFlight,
    /// The chapter changed while the fetch was pending; the result was dropped.
    Stale,
}

#[derive(Debug, Default)]
struct RegistryInner {
    generation: u64,
    slices: Vec<Slice>,
}

/// Owns the slices of the open chapter. Cloning yields another handle onto the
/// same registry, so loader tasks can share it with the session.
#[derive(Debug, Clone, Default)]
pub struct SliceRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SliceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces every slice and starts a new chapter generation.
    pub fn initialize(&self, specs: &[SliceSpec]) -> Result<u64, RegistryError> {
        validate_slices(specs)?;
        let mut guard = self.lock();
        guard.generation += 1;
        guard.slices = specs.iter().map(Slice::from_spec).collect();
        debug!(
            generation = guard.generation,
            slices = guard.slices.len(),
            "slice registry initialized"
        );
        Ok(guard.generation)
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn len(&self) -> usize {
        self.lock().slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slices.is_empty()
    }

    pub fn total_height(&self) -> u32 {
        self.lock().slices.last().map(|slice| slice.end_y).unwrap_or(0)
    }

    pub fn is_loaded(&self, index: usize) -> bool {
        self.lock()
            .slices
            .get(index)
            .is_some_and(Slice::is_loaded)
    }

    pub fn state(&self, index: usize) -> Option<LoadState> {
        self.lock().slices.get(index).map(|slice| slice.state)
    }

    pub fn get(&self, index: usize) -> Option<Slice> {
        self.lock().slices.get(index).cloned()
    }

    pub fn snapshot(&self) -> Vec<Slice> {
        self.lock().slices.clone()
    }

    /// Stores the full composite as slice 0 (single-image chapters).
    pub fn store_full_image(&self, bytes: Vec<u8>) -> Result<(), RegistryError> {
        let mut guard = self.lock();
        let slice = guard
            .slices
            .first_mut()
            .ok_or(RegistryError::UnknownSlice(0))?;
        slice.pixels = Some(PixelHandle::new(bytes));
        slice.state = LoadState::Loaded;
        Ok(())
    }

    /// Fetches slice `index` unless it is already loaded or being loaded.
    /// A failed slice is fetched again.
    pub async fn request_load<S: ImageService>(
        &self,
        service: &S,
        index: usize,
    ) -> Result<LoadOutcome, RegistryError> {
        let generation = {
            let mut guard = self.lock();
            let generation = guard.generation;
            let slice = guard
                .slices
                .get_mut(index)
                .ok_or(RegistryError::UnknownSlice(index))?;
            match slice.state {
                LoadState::Loaded => return Ok(LoadOutcome::AlreadyLoaded),
                LoadState::Loading => return Ok(LoadOutcome::InFlight),
                LoadState::Unloaded | LoadState::Failed => slice.state = LoadState::Loading,
            }
            generation
        };

        let fetched = service.fetch_slice_bytes(index).await;

        let mut guard = self.lock();
        if guard.generation != generation {
            debug!(index, generation, "discarding slice fetched for a previous chapter");
            return Ok(LoadOutcome::Stale);
        }
        let slice = guard
            .slices
            .get_mut(index)
            .ok_or(RegistryError::UnknownSlice(index))?;

        match fetched {
            Ok(bytes) => {
                debug!(index, bytes = bytes.len(), "slice loaded");
                slice.pixels = Some(PixelHandle::new(bytes));
                slice.state = LoadState::Loaded;
                Ok(LoadOutcome::Loaded)
            }
            Err(source) => {
                slice.state = LoadState::Failed;
                Err(RegistryError::SliceFetch { index, source })
            }
        }
    }
}

/// Loads one slice and publishes the outcome. Fetch failures are logged and
/// reported but never propagated.
pub(crate) async fn load_and_report<S: ImageService>(
    registry: &SliceRegistry,
    service: &S,
    index: usize,
    events: &EventSender,
) {
    match registry.request_load(service, index).await {
        Ok(LoadOutcome::Loaded) => publish(events, SessionEvent::SliceLoaded { index }),
        Ok(outcome) => debug!(index, ?outcome, "slice load skipped"),
        Err(err) => {
            warn!(index, error = %err, "slice load failed");
            publish(
                events,
                SessionEvent::SliceFailed {
                    index,
                    message: err.to_string(),
                },
            );
        }
    }
}

/// Loads slices `start..` one at a time in ascending order, pausing `delay`
/// before each request. Stops as soon as the registry moves to another chapter.
pub(crate) async fn load_remaining<S: ImageService>(
    registry: SliceRegistry,
    service: Arc<S>,
    generation: u64,
    start: usize,
    delay: Duration,
    events: EventSender,
) {
    let count = registry.len();
    for index in start..count {
        sleep(delay).await;
        if registry.generation() != generation {
            debug!(generation, index, "background loading superseded by a newer chapter");
            return;
        }
        load_and_report(&registry, service.as_ref(), index, &events).await;
    }

    if registry.generation() == generation {
        info!(generation, slices = count, "background slice loading finished");
        publish(&events, SessionEvent::BackgroundLoadFinished { generation });
    }
}
