//! Mask collection: ordered mask candidates for one annotated region.
//!
//! DESIGN
//! ======
//! The collection is never empty and `active_index` always addresses a
//! candidate. Deleting the last candidate replaces it with a fresh empty one.
//! Operations are total: an out-of-range index is logged and ignored rather
//! than surfaced, since indices come from the session's own view.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::rle::{self, ImageSize, Rle};

/// Current time as milliseconds since Unix epoch.
pub(crate) fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// MASK CANDIDATE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskCandidate {
    pub id: String,
    /// `None` until a mask has been generated or loaded.
    pub rle: Option<Rle>,
    /// Loaded from (or since written to) persistence.
    pub is_existing: bool,
    /// `rle` is the synthesized empty placeholder, not real mask data.
    pub is_fallback: bool,
    /// Milliseconds since Unix epoch of the last change to `rle`.
    pub timestamp: i64,
}

impl MaskCandidate {
    #[must_use]
    pub fn empty() -> Self {
        Self { id: Uuid::new_v4().to_string(), rle: None, is_existing: false, is_fallback: false, timestamp: now_ms() }
    }

    fn existing(rle: Rle) -> Self {
        let is_fallback = rle.is_placeholder();
        Self { id: Uuid::new_v4().to_string(), rle: Some(rle), is_existing: true, is_fallback, timestamp: now_ms() }
    }
}

/// Persisted form of one candidate: canonical RLE plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedMask {
    pub id: String,
    pub rle: Rle,
    pub is_existing: bool,
    pub is_fallback: bool,
}

// =============================================================================
// MASK COLLECTION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaskCollection {
    region_id: String,
    candidates: Vec<MaskCandidate>,
    active_index: usize,
}

impl MaskCollection {
    /// A collection holding a single empty candidate.
    #[must_use]
    pub fn new(region_id: impl Into<String>) -> Self {
        Self { region_id: region_id.into(), candidates: vec![MaskCandidate::empty()], active_index: 0 }
    }

    /// One existing candidate per persisted mask, or a single empty one when
    /// there are none. Payloads are canonicalized against the image; ones
    /// that cannot be canonicalized are skipped.
    #[must_use]
    pub fn from_persisted(region_id: impl Into<String>, persisted: &[Value], dims: Option<ImageSize>) -> Self {
        let region_id = region_id.into();
        let candidates: Vec<MaskCandidate> = persisted
            .iter()
            .enumerate()
            .filter_map(|(i, raw)| match rle::canonicalize(raw, dims) {
                Ok(rle) => Some(MaskCandidate::existing(rle)),
                Err(e) => {
                    warn!(error = %e, index = i, region_id = %region_id, "skipping persisted mask");
                    None
                }
            })
            .collect();

        if candidates.is_empty() {
            return Self::new(region_id);
        }
        Self { region_id, candidates, active_index: 0 }
    }

    #[must_use]
    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    #[must_use]
    pub fn candidates(&self) -> &[MaskCandidate] {
        &self.candidates
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Always `false`; present for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    #[must_use]
    pub fn active_index(&self) -> usize {
        self.active_index
    }

    #[must_use]
    pub fn active(&self) -> &MaskCandidate {
        &self.candidates[self.active_index]
    }

    /// Append an empty candidate and make it active. Returns its index.
    pub fn add_empty(&mut self) -> usize {
        self.candidates.push(MaskCandidate::empty());
        self.active_index = self.candidates.len() - 1;
        self.active_index
    }

    /// Remove the candidate at `index`. Removing the only candidate leaves a
    /// single fresh empty one. Returns `false` if `index` is out of range.
    pub fn delete(&mut self, index: usize) -> bool {
        if index >= self.candidates.len() {
            warn!(index, len = self.candidates.len(), region_id = %self.region_id, "delete index out of range");
            return false;
        }
        self.candidates.remove(index);
        if self.candidates.is_empty() {
            self.candidates.push(MaskCandidate::empty());
        }
        self.active_index = index.min(self.candidates.len() - 1);
        true
    }

    /// Drop the active candidate's mask but keep its identity.
    pub fn clear_active(&mut self) {
        let active = &mut self.candidates[self.active_index];
        active.rle = None;
        active.is_fallback = false;
        active.timestamp = now_ms();
    }

    /// Switch the active candidate and return its stored mask. `None` means
    /// `index` is out of range and nothing changed; `Some(None)` is a
    /// candidate not generated yet.
    pub fn set_active(&mut self, index: usize) -> Option<Option<&Rle>> {
        if index >= self.candidates.len() {
            warn!(index, len = self.candidates.len(), region_id = %self.region_id, "set_active index out of range");
            return None;
        }
        self.active_index = index;
        Some(self.active().rle.as_ref())
    }

    /// Store a canonical mask on the active candidate.
    pub fn replace_active(&mut self, rle: Rle) {
        let active = &mut self.candidates[self.active_index];
        active.is_fallback = rle.is_placeholder();
        active.rle = Some(rle);
        active.timestamp = now_ms();
    }

    /// Every candidate that holds a mask, in order, ready for persistence.
    #[must_use]
    pub fn to_saved(&self) -> Vec<SavedMask> {
        self.candidates
            .iter()
            .filter_map(|c| {
                c.rle.as_ref().map(|rle| SavedMask {
                    id: c.id.clone(),
                    rle: rle.clone(),
                    is_existing: c.is_existing,
                    is_fallback: c.is_fallback,
                })
            })
            .collect()
    }

    /// Flag the candidates with these ids as persisted.
    pub fn mark_existing(&mut self, ids: &[String]) {
        for candidate in &mut self.candidates {
            if ids.contains(&candidate.id) {
                candidate.is_existing = true;
            }
        }
    }
}

#[cfg(test)]
#[path = "collection_test.rs"]
mod tests;
