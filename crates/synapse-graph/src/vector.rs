//! Flat nearest-neighbour index over node embeddings.
//!
//! Exact search over unit-normalised vectors with squared L2 distance
//! (the scoring convention of flat L2 indexes elsewhere). At the
//! scale of a per-project episodic graph an exact scan beats an
//! approximate structure on both simplicity and the visibility guarantee
//! (a vector is searchable the instant it is inserted). Handles are dense
//! i64 slots so they survive snapshot round-trips unchanged.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SNAPSHOT_FILE: &str = "vectors.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    dimension: usize,
    /// Slot per handle; `None` marks a vector dropped by `clear`.
    vectors: Vec<Option<Vec<f32>>>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.vectors.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a vector and return its handle. Vectors are normalised to
    /// unit length on the way in; zero or wrongly-sized vectors are
    /// rejected.
    pub fn insert(&mut self, vector: &[f32]) -> Result<i64> {
        if vector.len() != self.dimension {
            anyhow::bail!(
                "vector dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            );
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            anyhow::bail!("refusing to index a zero or non-finite vector");
        }
        let unit: Vec<f32> = vector.iter().map(|v| v / norm).collect();
        let handle = self.vectors.len() as i64;
        self.vectors.push(Some(unit));
        Ok(handle)
    }

    /// The `k` nearest handles by squared L2 distance, ascending (closer
    /// first).
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        if query.len() != self.dimension || k == 0 {
            return Vec::new();
        }
        let norm = query.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return Vec::new();
        }
        let unit: Vec<f32> = query.iter().map(|v| v / norm).collect();

        let mut scored: Vec<(i64, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .filter_map(|(handle, slot)| {
                slot.as_ref().map(|vector| {
                    let distance = vector
                        .iter()
                        .zip(unit.iter())
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f32>();
                    (handle as i64, distance)
                })
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    pub fn contains(&self, handle: i64) -> bool {
        usize::try_from(handle)
            .ok()
            .and_then(|index| self.vectors.get(index))
            .is_some_and(Option::is_some)
    }

    /// Serialise to the index's native snapshot file inside `dir`.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        let payload = serde_json::to_vec(self).context("failed serialising vector index")?;
        let path = dir.join(SNAPSHOT_FILE);
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("failed writing vector index {path:?}"))?;
        debug!(count = self.len(), "vector index saved");
        Ok(())
    }

    /// Load from `dir`, treating a missing snapshot as an empty index.
    pub async fn load(dir: &Path, dimension: usize) -> Self {
        let path = dir.join(SNAPSHOT_FILE);
        match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice::<Self>(&raw) {
                Ok(index) if index.dimension == dimension => index,
                Ok(index) => {
                    tracing::warn!(
                        expected = dimension,
                        found = index.dimension,
                        "vector index dimension changed, starting empty"
                    );
                    Self::new(dimension)
                }
                Err(error) => {
                    tracing::warn!(%error, "corrupt vector index, starting empty");
                    Self::new(dimension)
                }
            },
            Err(_) => Self::new(dimension),
        }
    }

    pub fn clear(&mut self) {
        self.vectors.clear();
    }
}
