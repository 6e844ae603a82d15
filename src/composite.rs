use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Geometry of one source segment inside the composite strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceSpec {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub start_y: u32,
    pub end_y: u32,
}

/// What the backend reports about a chapter before any pixels are fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeDescription {
    pub total_width: u32,
    pub total_height: u32,
    #[serde(default)]
    pub needs_slicing: bool,
    pub slices: Vec<SliceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidSpecError {
    #[error("composite has no slices")]
    Empty,
    #[error("slice at position {position} reports index {index}")]
    IndexMismatch { position: usize, index: usize },
    #[error("slice {index} starts at {start_y}, expected {expected}")]
    Gap {
        index: usize,
        start_y: u32,
        expected: u32,
    },
    #[error("slice {index} has an empty or inverted range {start_y}..{end_y}")]
    EmptyRange { index: usize, start_y: u32, end_y: u32 },
    #[error("slice {index} height {height} does not match range {start_y}..{end_y}")]
    HeightMismatch {
        index: usize,
        height: u32,
        start_y: u32,
        end_y: u32,
    },
    #[error("slices end at {covered}, composite height is {total_height}")]
    HeightNotCovered { covered: u32, total_height: u32 },
}

/// Checks that `specs` partition `[0, end)` in order, where `end` is the last
/// slice's `end_y`. Returns that end.
pub fn validate_slices(specs: &[SliceSpec]) -> Result<u32, InvalidSpecError> {
    if specs.is_empty() {
        return Err(InvalidSpecError::Empty);
    }

    let mut expected = 0u32;
    for (position, spec) in specs.iter().enumerate() {
        if spec.index != position {
            return Err(InvalidSpecError::IndexMismatch {
                position,
                index: spec.index,
            });
        }
        if spec.start_y != expected {
            return Err(InvalidSpecError::Gap {
                index: spec.index,
                start_y: spec.start_y,
                expected,
            });
        }
        if spec.end_y <= spec.start_y {
            return Err(InvalidSpecError::EmptyRange {
                index: spec.index,
                start_y: spec.start_y,
                end_y: spec.end_y,
            });
        }
        if spec.end_y - spec.start_y != spec.height {
            return Err(InvalidSpecError::HeightMismatch {
                index: spec.index,
                height: spec.height,
                start_y: spec.start_y,
                end_y: spec.end_y,
            });
        }
        expected = spec.end_y;
    }

    Ok(expected)
}

impl CompositeDescription {
    /// Builds a description from stacked `(width, height)` pieces.
    pub fn from_stack(total_width: u32, heights: &[(u32, u32)]) -> Self {
        let mut slices = Vec::with_capacity(heights.len());
        let mut cursor = 0u32;
        for (index, &(width, height)) in heights.iter().enumerate() {
            slices.push(SliceSpec {
                index,
                width,
                height,
                start_y: cursor,
                end_y: cursor + height,
            });
            cursor += height;
        }

        Self {
            total_width,
            total_height: cursor,
            needs_slicing: slices.len() > 1,
            slices,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidSpecError> {
        let covered = validate_slices(&self.slices)?;
        if covered != self.total_height {
            return Err(InvalidSpecError::HeightNotCovered {
                covered,
                total_height: self.total_height,
            });
        }
        Ok(())
    }

    pub fn is_single_image(&self) -> bool {
        !self.needs_slicing && self.slices.len() == 1
    }
}
