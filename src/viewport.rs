//! Primary view layout, miniature overview, and the lazy-loading triggers that
//! connect scrolling to the slice registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::events::EventSender;
use crate::separators::{SeparatorId, SeparatorSet};
use crate::service::ImageService;
use crate::slices::{load_and_report, Slice, SliceRegistry};

/// Scroll geometry of the primary view.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportState {
    pub scroll_offset: f64,
    pub viewport_height: f64,
    pub total_height: f64,
}

impl ViewportState {
    pub fn max_scroll(&self) -> f64 {
        (self.total_height - self.viewport_height).max(0.0)
    }

    /// Position of the viewport within the scrollable range, `0.0..=1.0`.
    /// Zero when the composite fits entirely in the viewport.
    pub fn scroll_ratio(&self) -> f64 {
        let scrollable = self.total_height - self.viewport_height;
        if scrollable <= 0.0 {
            return 0.0;
        }
        (self.scroll_offset / scrollable).clamp(0.0, 1.0)
    }

    pub fn viewport_height_ratio(&self) -> f64 {
        if self.total_height <= 0.0 {
            return 0.0;
        }
        self.viewport_height / self.total_height
    }

    pub fn fits(&self) -> bool {
        self.total_height <= self.viewport_height
    }
}

/// One slice placed in the primary view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceBlock {
    pub index: usize,
    pub top: f64,
    pub height: f64,
    pub width: u32,
    pub loaded: bool,
}

impl SliceBlock {
    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn label(&self) -> String {
        format!("Slice {} ({}px)", self.index + 1, self.height as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeparatorMarker {
    pub id: SeparatorId,
    pub top: f64,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tint {
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewBand {
    pub index: usize,
    pub top: f64,
    pub height: f64,
    pub tint: Tint,
}

/// Viewport indicator inside the overview, as fractions of its height.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportWindow {
    pub top: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewLayout {
    pub scale: f64,
    pub content_height: f64,
    pub bands: Vec<OverviewBand>,
    pub markers: Vec<f64>,
    pub window: ViewportWindow,
    pub scroll_top: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScrollBehavior {
    Instant,
    Smooth,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollRequest {
    pub top: f64,
    pub behavior: ScrollBehavior,
}

/// Decides whether a slice block is close enough to the visible area to load.
pub trait ProximityPredicate {
    fn is_near_visible(&self, block: &SliceBlock, view: &ViewportState) -> bool;
}

impl<F> ProximityPredicate for F
where
    F: Fn(&SliceBlock, &ViewportState) -> bool,
{
    fn is_near_visible(&self, block: &SliceBlock, view: &ViewportState) -> bool {
        self(block, view)
    }
}

/// Visible area grown by a fixed margin on both sides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginProximity {
    pub margin: f64,
}

impl ProximityPredicate for MarginProximity {
    fn is_near_visible(&self, block: &SliceBlock, view: &ViewportState) -> bool {
        let top = view.scroll_offset - self.margin;
        let bottom = view.scroll_offset + view.viewport_height + self.margin;
        block.top < bottom && block.bottom() > top
    }
}

#[derive(Debug, Clone)]
pub struct ViewportCoordinator {
    view: ViewportState,
    total_width: u32,
    overview_height: f64,
    overview_zoom: f64,
    blocks: Vec<SliceBlock>,
    markers: Vec<SeparatorMarker>,
    overview: OverviewLayout,
    armed: BTreeSet<usize>,
    proximity: MarginProximity,
}

impl ViewportCoordinator {
    pub fn new(proximity_margin: f64, overview_zoom: f64) -> Self {
        Self {
            view: ViewportState::default(),
            total_width: 0,
            overview_height: 0.0,
            overview_zoom: overview_zoom.max(1.0),
            blocks: Vec::new(),
            markers: Vec::new(),
            overview: OverviewLayout::default(),
            armed: BTreeSet::new(),
            proximity: MarginProximity {
                margin: proximity_margin,
            },
        }
    }

    /// Drops the previous chapter's layout and scroll position. Client sizes
    /// are kept.
    pub fn reset(&mut self, total_width: u32, total_height: u32) {
        self.view.scroll_offset = 0.0;
        self.view.total_height = f64::from(total_height);
        self.total_width = total_width;
        self.blocks.clear();
        self.markers.clear();
        self.overview = OverviewLayout::default();
        self.armed.clear();
    }

    pub fn state(&self) -> ViewportState {
        self.view
    }

    pub fn total_width(&self) -> u32 {
        self.total_width
    }

    pub fn blocks(&self) -> &[SliceBlock] {
        &self.blocks
    }

    pub fn markers(&self) -> &[SeparatorMarker] {
        &self.markers
    }

    pub fn overview(&self) -> &OverviewLayout {
        &self.overview
    }

    pub fn is_armed(&self, index: usize) -> bool {
        self.armed.contains(&index)
    }

    pub fn resize(&mut self, viewport_height: f64, overview_height: f64) {
        self.view.viewport_height = viewport_height.max(0.0);
        self.overview_height = overview_height.max(0.0);
    }

    pub fn set_scroll_offset(&mut self, offset: f64) {
        self.view.scroll_offset = offset.clamp(0.0, self.view.max_scroll());
        self.sync_scroll();
    }

    /// Lays out slices top to bottom and arms a trigger for every slice that
    /// still needs pixels.
    pub fn render(&mut self, slices: &[Slice], separators: &SeparatorSet) {
        self.blocks.clear();
        self.armed.clear();

        let mut current_y = 0.0;
        for slice in slices {
            let block = SliceBlock {
                index: slice.index,
                top: current_y,
                height: f64::from(slice.height),
                width: slice.width,
                loaded: slice.is_loaded(),
            };
            if !block.loaded {
                self.armed.insert(slice.index);
            }
            self.blocks.push(block);
            current_y += f64::from(slice.height);
        }

        self.render_markers(separators);
        self.render_overview(slices, separators);
        self.sync_scroll();
    }

    pub fn render_markers(&mut self, separators: &SeparatorSet) {
        self.markers = separators
            .iter()
            .map(|separator| SeparatorMarker {
                id: separator.id,
                top: f64::from(separator.position),
                label: format!("{}px", separator.position),
            })
            .collect();
    }

    pub fn render_overview(&mut self, slices: &[Slice], separators: &SeparatorSet) {
        let content_height = self.overview_height * self.overview_zoom;
        let scale = if self.view.total_height > 0.0 {
            content_height / self.view.total_height
        } else {
            0.0
        };

        let mut current_y = 0.0;
        let bands = slices
            .iter()
            .enumerate()
            .map(|(position, slice)| {
                let height = f64::from(slice.height);
                let band = OverviewBand {
                    index: slice.index,
                    top: current_y * scale,
                    height: height * scale,
                    tint: if position % 2 == 0 { Tint::Light } else { Tint::Dark },
                };
                current_y += height;
                band
            })
            .collect();

        let markers = separators
            .iter()
            .map(|separator| f64::from(separator.position) * scale)
            .collect();

        self.overview = OverviewLayout {
            scale,
            content_height,
            bands,
            markers,
            window: self.overview.window,
            scroll_top: self.overview.scroll_top,
        };
    }

    /// Mirrors the primary scroll position onto the overview. The overview
    /// never drives the primary view.
    pub fn sync_scroll(&mut self) {
        let ratio = self.view.scroll_ratio();
        let height_ratio = self.view.viewport_height_ratio();
        let scrollable = (self.overview.content_height - self.overview_height).max(0.0);

        self.overview.scroll_top = scrollable * ratio;
        self.overview.window = if self.view.fits() {
            ViewportWindow {
                top: 0.0,
                height: height_ratio,
            }
        } else {
            let height = height_ratio.min(1.0);
            ViewportWindow {
                top: ratio * (1.0 - height),
                height,
            }
        };
    }

    /// Request that centers `position` in the primary view.
    pub fn scroll_to_position(&self, position: u32) -> ScrollRequest {
        let target = f64::from(position) - self.view.viewport_height / 2.0;
        ScrollRequest {
            top: target.clamp(0.0, self.view.max_scroll()),
            behavior: ScrollBehavior::Smooth,
        }
    }

    pub fn mark_loaded(&mut self, index: usize) {
        if let Some(block) = self.blocks.iter_mut().find(|block| block.index == index) {
            block.loaded = true;
        }
        self.armed.remove(&index);
    }

    /// Arms the trigger of a slice whose load failed so the next time it comes
    /// near the view it is requested again.
    pub fn rearm(&mut self, index: usize) {
        if let Some(block) = self.blocks.iter_mut().find(|block| block.index == index) {
            block.loaded = false;
            self.armed.insert(index);
        }
    }

    /// Disarms and returns every armed slice the predicate reports as near
    /// the visible area. Each trigger fires at most once per render.
    pub fn take_near_visible<P: ProximityPredicate + ?Sized>(&mut self, predicate: &P) -> Vec<usize> {
        let view = self.view;
        let triggered: Vec<usize> = self
            .blocks
            .iter()
            .filter(|block| self.armed.contains(&block.index))
            .filter(|block| predicate.is_near_visible(block, &view))
            .map(|block| block.index)
            .collect();
        for index in &triggered {
            self.armed.remove(index);
        }
        triggered
    }

    /// Fires the default margin triggers and spawns one load per triggered
    /// slice. Returns the triggered indices.
    pub fn dispatch_lazy_loads<S: ImageService>(
        &mut self,
        registry: &SliceRegistry,
        service: &Arc<S>,
        events: &EventSender,
    ) -> Vec<usize> {
        let proximity = self.proximity;
        let triggered = self.take_near_visible(&proximity);
        for &index in &triggered {
            debug!(index, "slice entered load proximity");
            let registry = registry.clone();
            let service = Arc::clone(service);
            let events = events.clone();
            tokio::spawn(async move {
                load_and_report(&registry, service.as_ref(), index, &events).await;
            });
        }
        triggered
    }
}
