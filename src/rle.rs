//! RLE canonicalizer: the single gate every mask passes through.
//!
//! DESIGN
//! ======
//! Masks arrive from the backend, from persisted annotations and from the
//! operator's own saves as loosely-shaped JSON. Before a mask is previewed,
//! stored in a collection or sent to persistence it is reduced to exactly
//! `{counts, size}` so nothing downstream can depend on transient fields
//! (timestamps, scores, debug info) riding along in a payload.
//!
//! EDGE CASES
//! ==========
//! - `counts` given as an uncompressed run array is compressed into the COCO
//!   string form.
//! - A `size` that disagrees with the known image dimensions is rewritten to
//!   match the image, as the backend does when it decodes masks.
//! - Missing or malformed `counts`/`size` becomes an explicit empty
//!   placeholder when image dimensions are known, `InvalidMaskData` otherwise.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::AnnotatorError;

/// Run counts of the explicit "empty" placeholder mask.
pub const EMPTY_COUNTS: &str = "0";

// =============================================================================
// TYPES
// =============================================================================

/// Pixel dimensions of the image a mask belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Canonical run-length encoded mask. `size` is `[height, width]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rle {
    pub counts: String,
    pub size: [u32; 2],
}

impl Rle {
    /// The explicit "no mask" placeholder for an image.
    #[must_use]
    pub fn empty(dims: ImageSize) -> Self {
        Self { counts: EMPTY_COUNTS.to_string(), size: [dims.height, dims.width] }
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.counts == EMPTY_COUNTS
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.size[0]
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.size[1]
    }

    /// Number of foreground pixels, or `None` if `counts` is not a valid COCO
    /// compressed string.
    #[must_use]
    pub fn foreground_area(&self) -> Option<u64> {
        let counts = decode_counts(&self.counts)?;
        Some(counts.iter().skip(1).step_by(2).map(|&c| u64::from(c)).sum())
    }
}

// =============================================================================
// CANONICALIZATION
// =============================================================================

/// Strictly parse a mask payload into canonical form.
///
/// `raw` may be an object or a JSON string holding one. When `dims` is given
/// the result's `size` always matches it.
///
/// # Errors
///
/// Returns [`AnnotatorError::InvalidMaskData`] if `counts` or `size` is
/// missing, empty or of the wrong shape.
pub fn parse(raw: &Value, dims: Option<ImageSize>) -> Result<Rle, AnnotatorError> {
    let nested;
    let raw = match raw {
        Value::String(text) => {
            nested = serde_json::from_str::<Value>(text)
                .map_err(|e| AnnotatorError::InvalidMaskData(format!("mask string is not JSON: {e}")))?;
            &nested
        }
        other => other,
    };

    let Value::Object(fields) = raw else {
        return Err(AnnotatorError::InvalidMaskData("mask must be an object".into()));
    };

    let counts = match fields.get("counts") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Array(runs)) if !runs.is_empty() => {
            let runs = runs
                .iter()
                .map(|v| v.as_u64().and_then(|n| u32::try_from(n).ok()))
                .collect::<Option<Vec<u32>>>()
                .ok_or_else(|| AnnotatorError::InvalidMaskData("counts array must hold u32 runs".into()))?;
            encode_counts(&runs)
        }
        Some(_) => return Err(AnnotatorError::InvalidMaskData("counts is empty or malformed".into())),
        None => return Err(AnnotatorError::InvalidMaskData("missing counts".into())),
    };

    let size = match fields.get("size") {
        Some(Value::Array(dims)) if dims.len() == 2 => {
            let h = dims[0].as_u64().and_then(|n| u32::try_from(n).ok());
            let w = dims[1].as_u64().and_then(|n| u32::try_from(n).ok());
            match (h, w) {
                (Some(h), Some(w)) if h > 0 && w > 0 => [h, w],
                _ => return Err(AnnotatorError::InvalidMaskData("size must be two positive integers".into())),
            }
        }
        Some(_) => return Err(AnnotatorError::InvalidMaskData("size must be [height, width]".into())),
        None => return Err(AnnotatorError::InvalidMaskData("missing size".into())),
    };

    let mut rle = Rle { counts, size };
    if let Some(dims) = dims {
        let expected = [dims.height, dims.width];
        if rle.size != expected {
            warn!(size = ?rle.size, ?expected, "mask size does not match image; adjusting");
            rle.size = expected;
        }
    }
    Ok(rle)
}

/// Reduce any mask payload to canonical form, substituting the empty
/// placeholder for invalid data when image dimensions are known.
///
/// # Errors
///
/// Returns [`AnnotatorError::InvalidMaskData`] only when the payload is
/// invalid and `dims` is `None`.
pub fn canonicalize(raw: &Value, dims: Option<ImageSize>) -> Result<Rle, AnnotatorError> {
    match parse(raw, dims) {
        Ok(rle) => Ok(rle),
        Err(e) => {
            let Some(dims) = dims else {
                return Err(e);
            };
            debug!(error = %e, "substituting empty placeholder mask");
            Ok(Rle::empty(dims))
        }
    }
}

// =============================================================================
// COCO COUNTS STRING
// =============================================================================

/// Compress run counts into the COCO string form (pycocotools `rleToString`).
#[must_use]
pub fn encode_counts(counts: &[u32]) -> String {
    let mut s = String::with_capacity(counts.len() * 2);
    for (i, &count) in counts.iter().enumerate() {
        let mut x = i64::from(count);
        if i > 2 {
            x -= i64::from(counts[i - 2]);
        }
        loop {
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let mut c = (x & 0x1f) as u8;
            x >>= 5;
            let more = if c & 0x10 != 0 { x != -1 } else { x != 0 };
            if more {
                c |= 0x20;
            }
            s.push(char::from(c + 48));
            if !more {
                break;
            }
        }
    }
    s
}

/// Expand a COCO counts string back into run counts. `None` on malformed
/// input.
#[must_use]
pub fn decode_counts(s: &str) -> Option<Vec<u32>> {
    let bytes = s.as_bytes();
    let mut counts: Vec<u32> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let mut x: i64 = 0;
        let mut shift = 0u32;
        loop {
            let c = i64::from(bytes.get(i)?.checked_sub(48)?);
            if c > 0x3f || shift > 55 {
                return None;
            }
            i += 1;
            x |= (c & 0x1f) << shift;
            shift += 5;
            if c & 0x20 == 0 {
                if c & 0x10 != 0 {
                    x |= -1i64 << shift;
                }
                break;
            }
        }
        if counts.len() > 2 {
            x += i64::from(counts[counts.len() - 2]);
        }
        counts.push(u32::try_from(x).ok()?);
    }
    Some(counts)
}

#[cfg(test)]
#[path = "rle_test.rs"]
mod tests;
