use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::composite::{CompositeDescription, InvalidSpecError};
use crate::config::SplitterConfig;
use crate::events::{
    self, publish, EventSender, SessionEvent, PROGRESS_FIRST_SLICE, PROGRESS_METADATA,
    PROGRESS_READY, PROGRESS_RENDERED, PROGRESS_STARTED,
};
use crate::separators::{SeparatorError, SeparatorId, SeparatorSet};
use crate::service::{ImageService, ServiceError};
use crate::slices::{load_and_report, load_remaining, LoadState, RegistryError, SliceRegistry};
use crate::viewport::{ScrollRequest, ViewportCoordinator};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("chapter path is empty")]
    EmptyPath,
    #[error("no chapter is open")]
    NoChapter,
    #[error("there are no separators to export")]
    NoSeparators,
    #[error("an export is already running")]
    ExportInFlight,
    #[error("invalid composite description: {0}")]
    InvalidSpec(#[from] InvalidSpecError),
    #[error("failed to load chapter: {0}")]
    Loader(#[from] ServiceError),
    #[error(transparent)]
    Separator(#[from] SeparatorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl SessionError {
    /// Text shown to the user through the error channel.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::EmptyPath => "Chapter folder path is not specified".into(),
            SessionError::NoSeparators => "There are no separators to export".into(),
            SessionError::NoChapter => "Open a chapter first".into(),
            SessionError::ExportInFlight => "Export is already in progress".into(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    Idle,
    Loading,
    Ready,
    Exporting,
}

/// Input from the presentation layer, independent of any toolkit.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    /// Shift+click; `y` is relative to the top of the visible viewport.
    ShiftClick { y: f64 },
    DragStart { separator_id: SeparatorId, y: f64 },
    DragMove { y: f64 },
    DragEnd,
    KeyModifierChanged { shift: bool },
    Scrolled { offset: f64 },
    Resized { viewport_height: f64, overview_height: f64 },
    SelectSeparator { separator_id: SeparatorId },
    RemoveSeparator { position: u32 },
    ClearSeparators,
    AutoGenerate { pitch: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CursorStyle {
    Default,
    Crosshair,
}

/// What the presentation layer should do after an input was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SetCursor(CursorStyle),
    ScrollTo(ScrollRequest),
    /// Separator table, markers, or overview changed.
    SeparatorsChanged,
    OverviewSynced,
    /// Slices entered load proximity and are being fetched.
    LoadsStarted(Vec<usize>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct DragSession {
    separator_id: SeparatorId,
    start_y: f64,
    start_position: u32,
}

#[derive(Debug, Clone)]
pub struct Chapter {
    pub path: PathBuf,
    pub description: CompositeDescription,
    pub generation: u64,
}

/// All mutable state of one editing session.
#[derive(Debug)]
pub struct SessionState {
    pub chapter: Option<Chapter>,
    pub registry: SliceRegistry,
    pub separators: SeparatorSet,
    pub viewport: ViewportCoordinator,
    drag: Option<DragSession>,
    shift_held: bool,
}

impl SessionState {
    fn new(config: &SplitterConfig) -> Self {
        Self {
            chapter: None,
            registry: SliceRegistry::new(),
            separators: empty_separators(0, config),
            viewport: ViewportCoordinator::new(config.proximity_margin, config.overview_zoom),
            drag: None,
            shift_held: false,
        }
    }

    pub fn is_dragging(&self) -> bool {
        self.drag.is_some()
    }

    pub fn shift_held(&self) -> bool {
        self.shift_held
    }
}

fn empty_separators(total_height: u32, config: &SplitterConfig) -> SeparatorSet {
    SeparatorSet::new(total_height, config.separator_tolerance)
        .with_pitch_bounds(config.min_pitch, config.max_pitch)
}

/// Clears the in-flight export flag when dropped, including on panic.
struct ExportFlag(Arc<AtomicBool>);

impl Drop for ExportFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SessionController<S: ImageService> {
    service: Arc<S>,
    config: SplitterConfig,
    state: SessionState,
    phase: SessionPhase,
    exporting: Arc<AtomicBool>,
    events: EventSender,
    background: Option<JoinHandle<()>>,
}

impl<S: ImageService> SessionController<S> {
    pub fn new(service: Arc<S>, config: SplitterConfig, events: EventSender) -> Self {
        let config = config.normalize();
        Self {
            state: SessionState::new(&config),
            service,
            config,
            phase: SessionPhase::Idle,
            exporting: Arc::new(AtomicBool::new(false)),
            events,
            background: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        if self.phase == SessionPhase::Ready && self.exporting.load(Ordering::Acquire) {
            return SessionPhase::Exporting;
        }
        self.phase
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn separators(&self) -> &SeparatorSet {
        &self.state.separators
    }

    pub fn viewport(&self) -> &ViewportCoordinator {
        &self.state.viewport
    }

    pub fn registry(&self) -> &SliceRegistry {
        &self.state.registry
    }

    pub fn chapter(&self) -> Option<&Chapter> {
        self.state.chapter.as_ref()
    }

    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// Handle of the background loader started by the last `open_chapter`.
    pub fn take_background_task(&mut self) -> Option<JoinHandle<()>> {
        self.background.take()
    }

    fn report(&self, err: &SessionError) {
        warn!(error = %err, "session error");
        publish(
            &self.events,
            SessionEvent::Error {
                message: err.user_message(),
            },
        );
    }

    fn fail<T>(&self, err: SessionError) -> Result<T, SessionError> {
        self.report(&err);
        Err(err)
    }

    /// Loads the chapter at `path`. On failure the previously open chapter, if
    /// any, is left exactly as it was.
    pub async fn open_chapter(&mut self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return self.fail(SessionError::EmptyPath);
        }

        if self.exporting.load(Ordering::Acquire) {
            return self.fail(SessionError::ExportInFlight);
        }

        let previous_phase = self.phase;
        self.phase = SessionPhase::Loading;
        events::progress(&self.events, PROGRESS_STARTED, "Loading images...");
        info!(path = %path.display(), "opening chapter");

        let description = match self.fetch_description(path).await {
            Ok(description) => description,
            Err(err) => {
                self.phase = previous_phase;
                events::progress(&self.events, PROGRESS_STARTED, "Error");
                return self.fail(err);
            }
        };

        let generation = match self.state.registry.initialize(&description.slices) {
            Ok(generation) => generation,
            Err(err) => {
                self.phase = previous_phase;
                return self.fail(err.into());
            }
        };
        self.state.separators = empty_separators(description.total_height, &self.config);
        self.state
            .viewport
            .reset(description.total_width, description.total_height);
        self.state.drag = None;
        self.background = None;
        self.state.chapter = Some(Chapter {
            path: path.to_path_buf(),
            description: description.clone(),
            generation,
        });
        events::progress(&self.events, PROGRESS_METADATA, "Preparing display...");

        let mut progressive = true;
        if description.is_single_image() {
            match self.service.fetch_full_image_bytes().await {
                Ok(bytes) => {
                    self.state.registry.store_full_image(bytes)?;
                    events::progress(&self.events, PROGRESS_FIRST_SLICE, "Full image loaded");
                    progressive = false;
                }
                Err(err) => {
                    warn!(error = %err, "full image unavailable, falling back to slices");
                }
            }
        }
        if progressive {
            self.load_progressively(generation).await;
        }

        let slices = self.state.registry.snapshot();
        self.state.viewport.render(&slices, &self.state.separators);
        events::progress(&self.events, PROGRESS_RENDERED, "Images loaded. Rendering canvas...");
        self.state.viewport.dispatch_lazy_loads(
            &self.state.registry,
            &self.service,
            &self.events,
        );

        self.phase = SessionPhase::Ready;
        events::progress(&self.events, PROGRESS_READY, "Loaded successfully");
        info!(
            generation,
            slices = slices.len(),
            height = description.total_height,
            "chapter ready"
        );
        Ok(())
    }

    async fn fetch_description(&self, path: &Path) -> Result<CompositeDescription, SessionError> {
        let description = self.service.load_composite(path).await?;
        description.validate()?;
        Ok(description)
    }

    async fn load_progressively(&mut self, generation: u64) {
        let count = self.state.registry.len();
        let initial = self.config.initial_slices.min(count);

        for index in 0..initial {
            load_and_report(&self.state.registry, self.service.as_ref(), index, &self.events)
                .await;
            let progress = PROGRESS_METADATA
                + (index + 1) as f64 / initial as f64 * (PROGRESS_FIRST_SLICE - PROGRESS_METADATA);
            events::progress(
                &self.events,
                progress,
                format!("Loading image {}/{}", index + 1, count),
            );
        }
        events::progress(&self.events, PROGRESS_FIRST_SLICE, "Initial images loaded");

        if initial < count {
            let handle = tokio::spawn(load_remaining(
                self.state.registry.clone(),
                Arc::clone(&self.service),
                generation,
                initial,
                self.config.background_delay(),
                self.events.clone(),
            ));
            self.background = Some(handle);
        }
    }

    /// Sends the current separators to the exporter. Returns once the export
    /// has been started; completion arrives on the event stream.
    pub fn export_chapter(&mut self) -> Result<(), SessionError> {
        if self.state.chapter.is_none() {
            return self.fail(SessionError::NoChapter);
        }
        if self.state.separators.is_empty() {
            return self.fail(SessionError::NoSeparators);
        }
        if self
            .exporting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.fail(SessionError::ExportInFlight);
        }

        let mut positions = self.state.separators.positions();
        positions.dedup();
        let format = self.config.export_format.clone();
        info!(separators = positions.len(), %format, "export started");
        events::progress(&self.events, PROGRESS_STARTED, "Exporting images...");

        let service = Arc::clone(&self.service);
        let exporting = ExportFlag(Arc::clone(&self.exporting));
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = service.export_bands(positions, format).await;
            drop(exporting);
            match result {
                Ok(report) => {
                    info!(bands = report.band_count, "export finished");
                    publish(&events, SessionEvent::ExportFinished(report));
                }
                Err(err) => {
                    warn!(error = %err, "export failed");
                    let message = format!("Export failed: {err}");
                    publish(&events, SessionEvent::ExportFailed { message: message.clone() });
                    publish(&events, SessionEvent::Error { message });
                }
            }
        });
        Ok(())
    }

    /// Keeps the primary layout in step with slices that finished loading.
    pub fn on_slice_loaded(&mut self, index: usize) {
        self.state.viewport.mark_loaded(index);
    }

    /// Re-arms the lazy trigger of a slice whose fetch failed.
    pub fn on_slice_failed(&mut self, index: usize) {
        if self.state.registry.state(index) == Some(LoadState::Failed) {
            self.state.viewport.rearm(index);
        }
    }

    pub fn dispatch(&mut self, input: InputEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        match input {
            InputEvent::KeyModifierChanged { shift } => {
                self.state.shift_held = shift;
                effects.push(Effect::SetCursor(if shift {
                    CursorStyle::Crosshair
                } else {
                    CursorStyle::Default
                }));
            }
            InputEvent::ShiftClick { y } => self.handle_shift_click(y, &mut effects),
            InputEvent::DragStart { separator_id, y } => self.handle_drag_start(separator_id, y),
            InputEvent::DragMove { y } => self.handle_drag_move(y, &mut effects),
            InputEvent::DragEnd => {
                if self.state.drag.take().is_some() {
                    self.state.separators.settle();
                    self.refresh_separators(&mut effects);
                }
            }
            InputEvent::Scrolled { offset } => {
                self.state.viewport.set_scroll_offset(offset);
                effects.push(Effect::OverviewSynced);
                self.start_lazy_loads(&mut effects);
            }
            InputEvent::Resized {
                viewport_height,
                overview_height,
            } => {
                self.state.viewport.resize(viewport_height, overview_height);
                let slices = self.state.registry.snapshot();
                self.state
                    .viewport
                    .render_overview(&slices, &self.state.separators);
                self.state.viewport.sync_scroll();
                effects.push(Effect::OverviewSynced);
                self.start_lazy_loads(&mut effects);
            }
            InputEvent::SelectSeparator { separator_id } => {
                if let Some(separator) = self.state.separators.get(separator_id) {
                    effects.push(Effect::ScrollTo(
                        self.state.viewport.scroll_to_position(separator.position),
                    ));
                }
            }
            InputEvent::RemoveSeparator { position } => {
                if self.state.separators.remove(position).is_some() {
                    self.refresh_separators(&mut effects);
                }
            }
            InputEvent::ClearSeparators => {
                self.state.drag = None;
                self.state.separators.clear();
                self.refresh_separators(&mut effects);
            }
            InputEvent::AutoGenerate { pitch } => {
                match self.state.separators.auto_generate(pitch) {
                    Ok(added) => {
                        debug!(pitch, added, "separators generated");
                        self.refresh_separators(&mut effects);
                    }
                    Err(err) => self.report(&err.into()),
                }
            }
        }
        effects
    }

    fn handle_shift_click(&mut self, y: f64, effects: &mut Vec<Effect>) {
        if self.state.chapter.is_none() {
            return;
        }
        let absolute = (y + self.state.viewport.state().scroll_offset).round();
        if !(0.0..=f64::from(u32::MAX)).contains(&absolute) {
            return;
        }
        let before = self.state.separators.len();
        self.state.separators.add(absolute as u32);
        if self.state.separators.len() != before {
            self.refresh_separators(effects);
        }
    }

    fn handle_drag_start(&mut self, separator_id: SeparatorId, y: f64) {
        match self.state.separators.get(separator_id) {
            Some(separator) => {
                self.state.drag = Some(DragSession {
                    separator_id,
                    start_y: y,
                    start_position: separator.position,
                });
            }
            None => debug!(?separator_id, "drag started on unknown separator"),
        }
    }

    fn handle_drag_move(&mut self, y: f64, effects: &mut Vec<Effect>) {
        let Some(drag) = self.state.drag else {
            return;
        };
        let delta = (y - drag.start_y).round() as i64;
        let target = i64::from(drag.start_position) + delta;
        match self.state.separators.move_to(drag.separator_id, target) {
            Ok(_) => self.refresh_separators(effects),
            Err(err) => {
                debug!(error = %err, "drag target vanished");
                self.state.drag = None;
            }
        }
    }

    fn refresh_separators(&mut self, effects: &mut Vec<Effect>) {
        let slices = self.state.registry.snapshot();
        self.state.viewport.render_markers(&self.state.separators);
        self.state
            .viewport
            .render_overview(&slices, &self.state.separators);
        self.state.viewport.sync_scroll();
        effects.push(Effect::SeparatorsChanged);
    }

    fn start_lazy_loads(&mut self, effects: &mut Vec<Effect>) {
        if self.state.chapter.is_none() {
            return;
        }
        let triggered = self.state.viewport.dispatch_lazy_loads(
            &self.state.registry,
            &self.service,
            &self.events,
        );
        if !triggered.is_empty() {
            effects.push(Effect::LoadsStarted(triggered));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventReceiver;
    use crate::test_support::MockService;
    use std::time::Duration;

    fn quick_config() -> SplitterConfig {
        SplitterConfig {
            background_delay_ms: 1,
            ..SplitterConfig::default()
        }
    }

    fn controller(heights: &[u32]) -> (SessionController<MockService>, Arc<MockService>, EventReceiver) {
        let service = Arc::new(MockService::with_heights(heights));
        let (events, rx) = events::channel();
        let mut controller = SessionController::new(Arc::clone(&service), quick_config(), events);
        controller.dispatch(InputEvent::Resized {
            viewport_height: 1_000.0,
            overview_height: 500.0,
        });
        (controller, service, rx)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = rx.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn errors(events: &[SessionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Error { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    async fn wait_for_export(rx: &mut EventReceiver) -> SessionEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("export event in time")
                .expect("channel open");
            if matches!(
                event,
                SessionEvent::ExportFinished(_) | SessionEvent::ExportFailed { .. }
            ) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn end_to_end_split_and_export() {
        let (mut controller, service, mut rx) = controller(&[10_000, 10_000, 10_000]);

        controller.open_chapter("/chapters/ch1").await.unwrap();
        assert_eq!(controller.phase(), SessionPhase::Ready);
        assert_eq!(controller.separators().total_height(), 30_000);

        controller.dispatch(InputEvent::ShiftClick { y: 8_000.0 });
        controller.dispatch(InputEvent::Scrolled { offset: 20_000.0 });
        controller.dispatch(InputEvent::ShiftClick { y: 2_000.0 });
        assert_eq!(controller.separators().segments(), vec![8_000, 14_000, 8_000]);

        controller.export_chapter().unwrap();
        let event = wait_for_export(&mut rx).await;
        assert!(matches!(event, SessionEvent::ExportFinished(ref report) if report.band_count == 3));
        assert_eq!(
            service.exports(),
            vec![(vec![8_000, 22_000], "webp".to_string())]
        );
        assert_eq!(controller.phase(), SessionPhase::Ready);
    }

    #[tokio::test]
    async fn open_reports_progress_milestones() {
        let (mut controller, _service, mut rx) = controller(&[5_000, 5_000]);
        controller.open_chapter("/chapters/ch2").await.unwrap();

        let milestones: Vec<f64> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::Progress(progress) => Some(progress.percentage),
                _ => None,
            })
            .collect();
        for expected in [0.0, 20.0, 80.0, 91.0, 100.0] {
            assert!(milestones.contains(&expected), "missing {expected} in {milestones:?}");
        }
        assert_eq!(milestones.last(), Some(&100.0));
    }

    #[tokio::test]
    async fn first_slice_loads_before_background_finishes_the_rest() {
        let (mut controller, service, mut rx) = controller(&[3_000, 3_000, 3_000, 3_000]);
        controller.open_chapter("/chapters/ch3").await.unwrap();
        assert!(controller.registry().is_loaded(0));
        assert_eq!(service.fetch_order()[0], 0);

        let background = controller.take_background_task().expect("background loader");
        background.await.unwrap();

        assert!((0..4).all(|index| controller.registry().is_loaded(index)));
        for index in 0..4 {
            assert_eq!(service.slice_fetches(index), 1, "slice {index} fetched once");
        }
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, SessionEvent::BackgroundLoadFinished { .. })));
    }

    #[tokio::test]
    async fn single_image_uses_full_image_fast_path() {
        let (mut controller, service, _rx) = controller(&[7_000]);
        controller.open_chapter("/chapters/one").await.unwrap();

        assert_eq!(service.full_image_fetches(), 1);
        assert!(service.fetch_order().is_empty());
        assert!(controller.registry().is_loaded(0));
        assert!(controller.take_background_task().is_none());
    }

    #[tokio::test]
    async fn full_image_failure_falls_back_to_slices() {
        let (mut controller, service, _rx) = controller(&[7_000]);
        service.fail_full_image(true);
        controller.open_chapter("/chapters/one").await.unwrap();

        assert_eq!(service.full_image_fetches(), 1);
        assert_eq!(service.fetch_order(), vec![0]);
        assert!(controller.registry().is_loaded(0));
    }

    #[tokio::test]
    async fn failed_slice_does_not_block_chapter() {
        let (mut controller, service, mut rx) = controller(&[2_000, 2_000, 2_000]);
        service.fail_slice(0);
        controller.open_chapter("/chapters/broken").await.unwrap();
        controller.take_background_task().unwrap().await.unwrap();

        assert_eq!(controller.phase(), SessionPhase::Ready);
        assert_eq!(controller.registry().state(0), Some(LoadState::Failed));
        assert!(controller.registry().is_loaded(1));
        assert!(controller.registry().is_loaded(2));
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, SessionEvent::SliceFailed { index: 0, .. })));
    }

    #[tokio::test]
    async fn empty_path_is_rejected_without_calling_loader() {
        let (mut controller, service, mut rx) = controller(&[1_000]);
        let err = controller.open_chapter("").await.unwrap_err();

        assert!(matches!(err, SessionError::EmptyPath));
        assert!(service.loads().is_empty());
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert_eq!(
            errors(&drain(&mut rx)),
            vec!["Chapter folder path is not specified".to_string()]
        );
    }

    #[tokio::test]
    async fn loader_failure_keeps_previous_chapter() {
        let (mut controller, service, mut rx) = controller(&[10_000, 10_000]);
        controller.open_chapter("/chapters/good").await.unwrap();
        controller.dispatch(InputEvent::ShiftClick { y: 500.0 });
        let generation = controller.registry().generation();
        drain(&mut rx);

        service.fail_loads(true);
        let err = controller.open_chapter("/chapters/missing").await.unwrap_err();

        assert!(matches!(err, SessionError::Loader(_)));
        assert_eq!(controller.phase(), SessionPhase::Ready);
        assert_eq!(controller.chapter().unwrap().path, PathBuf::from("/chapters/good"));
        assert_eq!(controller.separators().positions(), vec![500]);
        assert_eq!(controller.registry().generation(), generation);
        assert_eq!(errors(&drain(&mut rx)).len(), 1);
    }

    #[tokio::test]
    async fn malformed_description_is_rejected() {
        let (mut controller, service, _rx) = controller(&[1_000]);
        let mut description = CompositeDescription::from_stack(800, &[(800, 100), (800, 100)]);
        description.slices[1].start_y = 150;
        description.slices[1].end_y = 250;
        service.set_description(description);

        let err = controller.open_chapter("/chapters/odd").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidSpec(_)));
        assert!(controller.chapter().is_none());
        assert_eq!(controller.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn reopening_resets_separators_and_viewport() {
        let (mut controller, service, _rx) = controller(&[10_000, 10_000]);
        controller.open_chapter("/chapters/a").await.unwrap();
        controller.dispatch(InputEvent::AutoGenerate { pitch: 5_000 });
        controller.dispatch(InputEvent::Scrolled { offset: 3_000.0 });
        assert_eq!(controller.separators().len(), 3);

        service.set_description(CompositeDescription::from_stack(800, &[(800, 6_000)]));
        controller.open_chapter("/chapters/b").await.unwrap();

        assert!(controller.separators().is_empty());
        assert_eq!(controller.separators().total_height(), 6_000);
        assert_eq!(controller.viewport().state().scroll_offset, 0.0);
        assert_eq!(controller.registry().len(), 1);
    }

    #[tokio::test]
    async fn export_without_separators_fails_without_service_call() {
        let (mut controller, service, mut rx) = controller(&[10_000]);
        controller.open_chapter("/chapters/a").await.unwrap();
        drain(&mut rx);

        let err = controller.export_chapter().unwrap_err();
        assert!(matches!(err, SessionError::NoSeparators));
        assert!(service.exports().is_empty());
        assert_eq!(
            errors(&drain(&mut rx)),
            vec!["There are no separators to export".to_string()]
        );
    }

    #[tokio::test]
    async fn export_without_chapter_fails() {
        let (mut controller, service, _rx) = controller(&[10_000]);
        assert!(matches!(controller.export_chapter(), Err(SessionError::NoChapter)));
        assert!(service.exports().is_empty());
    }

    #[tokio::test]
    async fn second_export_is_refused_while_first_runs() {
        let (mut controller, service, mut rx) = controller(&[10_000]);
        controller.open_chapter("/chapters/a").await.unwrap();
        controller.dispatch(InputEvent::ShiftClick { y: 4_000.0 });
        let gate = service.hold_exports();

        controller.export_chapter().unwrap();
        assert_eq!(controller.phase(), SessionPhase::Exporting);
        assert!(matches!(
            controller.export_chapter(),
            Err(SessionError::ExportInFlight)
        ));

        gate.release();
        wait_for_export(&mut rx).await;
        assert_eq!(controller.phase(), SessionPhase::Ready);
        assert_eq!(service.exports().len(), 1);

        controller.export_chapter().unwrap();
        wait_for_export(&mut rx).await;
        assert_eq!(service.exports().len(), 2);
    }

    #[tokio::test]
    async fn panicking_export_releases_the_export_slot() {
        let (mut controller, service, mut rx) = controller(&[10_000]);
        controller.open_chapter("/chapters/a").await.unwrap();
        controller.dispatch(InputEvent::ShiftClick { y: 4_000.0 });
        service.panic_exports(true);

        controller.export_chapter().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while controller.phase() == SessionPhase::Exporting {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("export slot released");

        service.panic_exports(false);
        controller.export_chapter().unwrap();
        let event = wait_for_export(&mut rx).await;
        assert!(matches!(event, SessionEvent::ExportFinished(_)));
        assert_eq!(service.exports().len(), 2);
    }

    #[tokio::test]
    async fn reopening_is_refused_while_export_runs() {
        let (mut controller, service, mut rx) = controller(&[10_000]);
        controller.open_chapter("/chapters/a").await.unwrap();
        controller.dispatch(InputEvent::ShiftClick { y: 4_000.0 });
        let gate = service.hold_exports();

        controller.export_chapter().unwrap();
        assert!(matches!(
            controller.open_chapter("/chapters/b").await,
            Err(SessionError::ExportInFlight)
        ));
        assert_eq!(service.loads().len(), 1);
        assert_eq!(controller.chapter().unwrap().path, PathBuf::from("/chapters/a"));
        assert_eq!(controller.separators().positions(), vec![4_000]);

        gate.release();
        wait_for_export(&mut rx).await;
        controller.open_chapter("/chapters/b").await.unwrap();
        assert_eq!(controller.chapter().unwrap().path, PathBuf::from("/chapters/b"));
    }

    #[tokio::test]
    async fn failed_export_is_reported_and_unlocks() {
        let (mut controller, service, mut rx) = controller(&[10_000]);
        controller.open_chapter("/chapters/a").await.unwrap();
        controller.dispatch(InputEvent::ShiftClick { y: 4_000.0 });
        service.fail_exports(true);
        drain(&mut rx);

        controller.export_chapter().unwrap();
        let event = wait_for_export(&mut rx).await;
        assert!(matches!(event, SessionEvent::ExportFailed { .. }));
        assert_eq!(controller.phase(), SessionPhase::Ready);
    }

    #[tokio::test]
    async fn drag_moves_separator_relative_to_pointer() {
        let (mut controller, _service, _rx) = controller(&[10_000]);
        controller.open_chapter("/chapters/a").await.unwrap();
        controller.dispatch(InputEvent::ShiftClick { y: 600.0 });
        let id = controller.separators().as_slice()[0].id;

        controller.dispatch(InputEvent::DragStart { separator_id: id, y: 300.0 });
        assert!(controller.state().is_dragging());
        let effects = controller.dispatch(InputEvent::DragMove { y: 450.0 });
        assert_eq!(effects, vec![Effect::SeparatorsChanged]);
        assert_eq!(controller.separators().positions(), vec![750]);

        controller.dispatch(InputEvent::DragMove { y: -5_000.0 });
        assert_eq!(controller.separators().positions(), vec![0]);
        controller.dispatch(InputEvent::DragMove { y: 50_000.0 });
        assert_eq!(controller.separators().positions(), vec![10_000]);

        controller.dispatch(InputEvent::DragEnd);
        assert!(!controller.state().is_dragging());
        assert!(controller.dispatch(InputEvent::DragMove { y: 0.0 }).is_empty());
        assert_eq!(controller.viewport().markers()[0].label, "10000px");
    }

    #[tokio::test]
    async fn drag_may_cross_neighbours() {
        let (mut controller, _service, _rx) = controller(&[10_000]);
        controller.open_chapter("/chapters/a").await.unwrap();
        controller.dispatch(InputEvent::ShiftClick { y: 1_000.0 });
        controller.dispatch(InputEvent::ShiftClick { y: 2_000.0 });
        let first = controller.separators().as_slice()[0].id;

        controller.dispatch(InputEvent::DragStart { separator_id: first, y: 0.0 });
        controller.dispatch(InputEvent::DragMove { y: 1_005.0 });
        assert_eq!(controller.separators().positions(), vec![2_000, 2_005]);
        controller.dispatch(InputEvent::DragEnd);

        assert_eq!(controller.separators().as_slice()[1].id, first);
    }

    #[tokio::test]
    async fn shift_click_and_export_during_drag_keep_the_drag() {
        let (mut controller, service, mut rx) = controller(&[10_000]);
        controller.open_chapter("/chapters/a").await.unwrap();
        controller.dispatch(InputEvent::ShiftClick { y: 1_000.0 });
        controller.dispatch(InputEvent::ShiftClick { y: 2_000.0 });
        let second = controller.separators().as_slice()[1].id;

        controller.dispatch(InputEvent::DragStart { separator_id: second, y: 0.0 });
        controller.dispatch(InputEvent::DragMove { y: -1_000.0 });
        assert_eq!(controller.separators().positions(), vec![1_000, 1_000]);

        controller.dispatch(InputEvent::ShiftClick { y: 5_000.0 });
        let effects = controller.dispatch(InputEvent::DragMove { y: -500.0 });
        assert_eq!(effects, vec![Effect::SeparatorsChanged]);
        assert!(controller.state().is_dragging());
        assert_eq!(controller.separators().positions(), vec![1_000, 1_500, 5_000]);

        controller.export_chapter().unwrap();
        controller.dispatch(InputEvent::DragMove { y: -400.0 });
        assert!(controller.state().is_dragging());
        assert_eq!(controller.separators().positions(), vec![1_000, 1_600, 5_000]);

        wait_for_export(&mut rx).await;
        assert_eq!(service.exports()[0].0, vec![1_000, 1_500, 5_000]);
    }

    #[tokio::test]
    async fn shift_modifier_toggles_crosshair() {
        let (mut controller, _service, _rx) = controller(&[1_000]);
        assert_eq!(
            controller.dispatch(InputEvent::KeyModifierChanged { shift: true }),
            vec![Effect::SetCursor(CursorStyle::Crosshair)]
        );
        assert!(controller.state().shift_held());
        assert_eq!(
            controller.dispatch(InputEvent::KeyModifierChanged { shift: false }),
            vec![Effect::SetCursor(CursorStyle::Default)]
        );
    }

    #[tokio::test]
    async fn shift_click_without_chapter_is_ignored() {
        let (mut controller, _service, _rx) = controller(&[1_000]);
        assert!(controller.dispatch(InputEvent::ShiftClick { y: 10.0 }).is_empty());
        assert!(controller.separators().is_empty());
    }

    #[tokio::test]
    async fn invalid_pitch_is_reported_without_changes() {
        let (mut controller, _service, mut rx) = controller(&[20_000]);
        controller.open_chapter("/chapters/a").await.unwrap();
        controller.dispatch(InputEvent::ShiftClick { y: 700.0 });
        drain(&mut rx);

        let effects = controller.dispatch(InputEvent::AutoGenerate { pitch: 3_000 });
        assert!(effects.is_empty());
        assert_eq!(controller.separators().positions(), vec![700]);
        let reported = errors(&drain(&mut rx));
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("between 4000 and 14000"));
    }

    #[tokio::test]
    async fn select_separator_scrolls_to_center() {
        let (mut controller, _service, _rx) = controller(&[20_000]);
        controller.open_chapter("/chapters/a").await.unwrap();
        controller.dispatch(InputEvent::AutoGenerate { pitch: 6_000 });
        let second = controller.separators().as_slice()[1].id;

        let effects = controller.dispatch(InputEvent::SelectSeparator { separator_id: second });
        assert_eq!(
            effects,
            vec![Effect::ScrollTo(controller.viewport().scroll_to_position(12_000))]
        );
        assert!(matches!(effects[0], Effect::ScrollTo(request) if request.top == 11_500.0));
    }

    #[tokio::test]
    async fn remove_and_clear_update_overview() {
        let (mut controller, _service, _rx) = controller(&[20_000]);
        controller.open_chapter("/chapters/a").await.unwrap();
        controller.dispatch(InputEvent::AutoGenerate { pitch: 5_000 });
        assert_eq!(controller.viewport().overview().markers.len(), 3);

        assert!(controller
            .dispatch(InputEvent::RemoveSeparator { position: 5_001 })
            .is_empty());
        controller.dispatch(InputEvent::RemoveSeparator { position: 5_000 });
        assert_eq!(controller.separators().positions(), vec![10_000, 15_000]);
        assert_eq!(controller.viewport().overview().markers.len(), 2);

        controller.dispatch(InputEvent::ClearSeparators);
        assert!(controller.separators().is_empty());
        assert!(controller.viewport().overview().markers.is_empty());
    }

    #[tokio::test]
    async fn scrolling_triggers_lazy_load_once() {
        let config = SplitterConfig {
            background_delay_ms: 60_000,
            ..SplitterConfig::default()
        };
        let service = Arc::new(MockService::with_heights(&[2_000, 2_000, 2_000, 2_000]));
        let (events, mut rx) = events::channel();
        let mut controller = SessionController::new(Arc::clone(&service), config, events);
        controller.dispatch(InputEvent::Resized {
            viewport_height: 1_000.0,
            overview_height: 400.0,
        });
        controller.open_chapter("/chapters/lazy").await.unwrap();
        drain(&mut rx);

        let effects = controller.dispatch(InputEvent::Scrolled { offset: 5_500.0 });
        assert!(effects.contains(&Effect::LoadsStarted(vec![2, 3])));

        let mut loaded = Vec::new();
        while loaded.len() < 2 {
            if let SessionEvent::SliceLoaded { index } = rx.recv().await.expect("event") {
                controller.on_slice_loaded(index);
                loaded.push(index);
            }
        }
        loaded.sort();
        assert_eq!(loaded, vec![2, 3]);
        assert!(!controller
            .dispatch(InputEvent::Scrolled { offset: 5_600.0 })
            .iter()
            .any(|effect| matches!(effect, Effect::LoadsStarted(_))));
        assert_eq!(service.slice_fetches(2), 1);
        assert!(!controller.registry().is_loaded(1));
    }

    #[tokio::test]
    async fn failed_lazy_load_is_retried_on_next_approach() {
        let config = SplitterConfig {
            background_delay_ms: 60_000,
            ..SplitterConfig::default()
        };
        let service = Arc::new(MockService::with_heights(&[2_000, 2_000, 2_000, 2_000]));
        let (events, mut rx) = events::channel();
        let mut controller = SessionController::new(Arc::clone(&service), config, events);
        controller.dispatch(InputEvent::Resized {
            viewport_height: 1_000.0,
            overview_height: 400.0,
        });
        controller.open_chapter("/chapters/lazy").await.unwrap();
        drain(&mut rx);
        service.fail_slice(3);

        let effects = controller.dispatch(InputEvent::Scrolled { offset: 6_500.0 });
        assert!(effects.contains(&Effect::LoadsStarted(vec![3])));
        loop {
            if let SessionEvent::SliceFailed { index, .. } = rx.recv().await.expect("event") {
                controller.on_slice_failed(index);
                break;
            }
        }

        service.heal_slice(3);
        let away = controller.dispatch(InputEvent::Scrolled { offset: 0.0 });
        assert_eq!(away, vec![Effect::OverviewSynced]);
        let back = controller.dispatch(InputEvent::Scrolled { offset: 6_500.0 });
        assert!(back.contains(&Effect::LoadsStarted(vec![3])));

        loop {
            if let SessionEvent::SliceLoaded { index } = rx.recv().await.expect("event") {
                controller.on_slice_loaded(index);
                break;
            }
        }
        assert!(controller.registry().is_loaded(3));
        assert_eq!(service.slice_fetches(3), 2);
    }

    #[tokio::test]
    async fn stale_background_loads_do_not_touch_new_chapter() {
        let (mut controller, service, _rx) = controller(&[1_000, 1_000, 1_000]);
        controller.open_chapter("/chapters/old").await.unwrap();
        let old_background = controller.take_background_task().unwrap();

        service.set_description(CompositeDescription::from_stack(800, &[(800, 500), (800, 500)]));
        controller.open_chapter("/chapters/new").await.unwrap();
        old_background.await.unwrap();
        controller.take_background_task().unwrap().await.unwrap();

        assert_eq!(controller.registry().len(), 2);
        assert_eq!(controller.registry().total_height(), 1_000);
        assert!(controller.registry().is_loaded(0));
        assert!(controller.registry().is_loaded(1));
    }
}
