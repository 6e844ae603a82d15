use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SeparatorId(u64);

impl SeparatorId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Separator {
    pub id: SeparatorId,
    pub position: u32,
}

/// Half-open vertical interval `[start, end)` exported as one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Band {
    pub start: u32,
    pub end: u32,
}

impl Band {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// One line of the separator table: position and the distance from the
/// previous separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeparatorRow {
    pub id: SeparatorId,
    pub position: u32,
    pub segment: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeparatorError {
    #[error("pitch must be between {min} and {max} pixels, got {pitch}")]
    InvalidPitch { pitch: u32, min: u32, max: u32 },
    #[error("separator {0:?} does not exist")]
    UnknownSeparator(SeparatorId),
}

#[derive(Debug, Clone)]
pub struct SeparatorSet {
    total_height: u32,
    tolerance: u32,
    min_pitch: u32,
    max_pitch: u32,
    next_id: u64,
    /// Kept ascending except while a drag is moving one entry.
    items: Vec<Separator>,
    dirty: bool,
}

impl Default for SeparatorSet {
    fn default() -> Self {
        Self::new(0, 10)
    }
}

impl SeparatorSet {
    pub fn new(total_height: u32, tolerance: u32) -> Self {
        Self {
            total_height,
            tolerance,
            min_pitch: 4_000,
            max_pitch: 14_000,
            next_id: 1,
            items: Vec::new(),
            dirty: false,
        }
    }

    pub fn with_pitch_bounds(mut self, min_pitch: u32, max_pitch: u32) -> Self {
        self.min_pitch = min_pitch;
        self.max_pitch = max_pitch;
        self
    }

    pub fn total_height(&self) -> u32 {
        self.total_height
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn page_count(&self) -> usize {
        self.items.len() + 1
    }

    fn sorted(&self) -> Vec<Separator> {
        let mut items = self.items.clone();
        if self.dirty {
            items.sort_by_key(|separator| (separator.position, separator.id));
        }
        items
    }

    /// Separators in ascending position order.
    pub fn iter(&self) -> impl Iterator<Item = Separator> {
        self.sorted().into_iter()
    }

    pub fn positions(&self) -> Vec<u32> {
        self.iter().map(|separator| separator.position).collect()
    }

    pub fn get(&self, id: SeparatorId) -> Option<Separator> {
        self.items.iter().copied().find(|separator| separator.id == id)
    }

    fn is_near_existing(&self, position: u32) -> bool {
        self.items
            .iter()
            .any(|separator| separator.position.abs_diff(position) < self.tolerance)
    }

    /// Inserts a separator unless one already sits within the tolerance, or the
    /// position lies outside the composite.
    pub fn add(&mut self, position: u32) -> &[Separator] {
        if position > self.total_height {
            debug!(position, total = self.total_height, "separator outside composite ignored");
            return self.as_slice();
        }
        if self.is_near_existing(position) {
            debug!(position, "separator within tolerance of an existing one ignored");
            return self.as_slice();
        }

        let id = SeparatorId(self.next_id);
        self.next_id += 1;
        if self.dirty {
            // Storage stays unsettled until the drag ends.
            self.items.push(Separator { id, position });
        } else {
            let slot = self
                .items
                .partition_point(|separator| separator.position <= position);
            self.items.insert(slot, Separator { id, position });
        }
        self.as_slice()
    }

    /// Stored order; ascending whenever no drag is in progress.
    pub fn as_slice(&self) -> &[Separator] {
        &self.items
    }

    /// Overwrites a separator's position during a drag. The value is clamped to
    /// the composite but never checked against neighbours.
    pub fn move_to(&mut self, id: SeparatorId, position: i64) -> Result<u32, SeparatorError> {
        let clamped = position.clamp(0, i64::from(self.total_height)) as u32;
        let separator = self
            .items
            .iter_mut()
            .find(|separator| separator.id == id)
            .ok_or(SeparatorError::UnknownSeparator(id))?;
        separator.position = clamped;
        self.dirty = true;
        Ok(clamped)
    }

    /// Restores storage order after a drag and merges separators that ended on
    /// the same pixel, keeping the older one.
    pub fn settle(&mut self) {
        if !self.dirty {
            return;
        }
        self.items
            .sort_by_key(|separator| (separator.position, separator.id));
        let before = self.items.len();
        self.items.dedup_by_key(|separator| separator.position);
        if self.items.len() != before {
            debug!(merged = before - self.items.len(), "coincident separators merged");
        }
        self.dirty = false;
    }

    /// Removes the separator at exactly `position`, if any.
    pub fn remove(&mut self, position: u32) -> Option<Separator> {
        let slot = self
            .items
            .iter()
            .position(|separator| separator.position == position)?;
        Some(self.items.remove(slot))
    }

    pub fn remove_id(&mut self, id: SeparatorId) -> Option<Separator> {
        let slot = self.items.iter().position(|separator| separator.id == id)?;
        Some(self.items.remove(slot))
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.dirty = false;
    }

    /// Adds a separator every `pitch` pixels. Existing separators are kept and
    /// the tolerance still applies.
    pub fn auto_generate(&mut self, pitch: u32) -> Result<usize, SeparatorError> {
        if pitch < self.min_pitch || pitch > self.max_pitch {
            return Err(SeparatorError::InvalidPitch {
                pitch,
                min: self.min_pitch,
                max: self.max_pitch,
            });
        }

        let before = self.items.len();
        let mut position = pitch;
        while position < self.total_height {
            self.add(position);
            position = match position.checked_add(pitch) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(self.items.len() - before)
    }

    pub fn bands(&self) -> Vec<Band> {
        let mut bands = Vec::with_capacity(self.items.len() + 1);
        let mut start = 0u32;
        for position in self.positions() {
            let band = Band {
                start,
                end: position,
            };
            if !band.is_empty() {
                bands.push(band);
            }
            start = position;
        }
        if start < self.total_height {
            bands.push(Band {
                start,
                end: self.total_height,
            });
        }
        bands
    }

    /// Lengths of the bands, top to bottom.
    pub fn segments(&self) -> Vec<u32> {
        self.bands().iter().map(Band::len).collect()
    }

    pub fn rows(&self) -> Vec<SeparatorRow> {
        let mut previous = 0u32;
        self.iter()
            .map(|separator| {
                let row = SeparatorRow {
                    id: separator.id,
                    position: separator.position,
                    segment: separator.position - previous,
                };
                previous = separator.position;
                row
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        format!("Separators: {} | Pages: {}", self.len(), self.page_count())
    }
}
