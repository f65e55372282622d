//! Training data: feature sequences and the utterances built on them.

use ndarray::{Array2, ArrayView1};

use crate::error::{Error, Result};

/// A variable-length sequence of fixed-dimension feature frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    /// `T x D`, one row per frame.
    frames: Array2<f64>,
}

impl Pattern {
    pub fn new(frames: Array2<f64>) -> Self {
        Self { frames }
    }

    /// Build from per-frame vectors.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the frames do not all have the same length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let dim = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != dim) {
            return Err(Error::InvalidInput(
                "pattern frames differ in dimension".to_string(),
            ));
        }
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let frames = Array2::from_shape_vec((rows.len(), dim), flat)
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        Ok(Self { frames })
    }

    pub fn len(&self) -> usize {
        self.frames.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.frames.ncols()
    }

    pub fn frame(&self, t: usize) -> ArrayView1<'_, f64> {
        self.frames.row(t)
    }

    pub fn frames(&self) -> &Array2<f64> {
        &self.frames
    }
}

/// One embedded-training utterance: a pattern and the model sequence its
/// transcription resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    id: String,
    pattern: Pattern,
    models: Vec<usize>,
}

impl Utterance {
    pub fn new(id: impl Into<String>, pattern: Pattern, models: Vec<usize>) -> Self {
        Self {
            id: id.into(),
            pattern,
            models,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Indices into the [`HmmSet`](crate::model::HmmSet), in transcription order.
    pub fn models(&self) -> &[usize] {
        &self.models
    }
}

/// Longest pattern in a collection.
pub fn max_frames<'a, I>(patterns: I) -> usize
where
    I: IntoIterator<Item = &'a Pattern>,
{
    patterns.into_iter().map(Pattern::len).max().unwrap_or(0)
}
