//! Versioned identity index.
//!
//! Readers clone an `Arc` snapshot and query it without any lock held;
//! `reload` builds a new snapshot and swaps the pointer. A query that
//! overlaps a swap completes against the snapshot it pinned, which is the
//! one-version skew the pipeline tolerates.
//!
//! Lookup is an exact inner-product scan over an (N x 512) matrix. At the
//! supported catalog size (10^4 embeddings) a scan is ~2M multiply-adds,
//! far under the latency budget, and needs no approximate structure.

use std::sync::{Arc, Mutex, RwLock};

use ndarray::{Array2, ArrayView1};
use tracing::{debug, info};
use vigil_protocol::{CatalogSnapshot, PersonStatus};

use crate::embed::EMBEDDING_DIM;
use crate::error::RecognitionError;

/// Best index row for a query embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub person_id: String,
    pub person_name: String,
    /// Inner product of L2-normalized vectors, in [-1, 1]
    pub similarity: f32,
}

/// Immutable index state at one catalog version.
pub struct IndexSnapshot {
    version: u64,
    content_hash: u64,
    /// Row i of `matrix` belongs to `person_ids[i]`. Rows are sorted by
    /// person id so equal-similarity ties resolve to the lowest id.
    person_ids: Vec<String>,
    person_names: Vec<String>,
    matrix: Array2<f32>,
}

impl IndexSnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            content_hash: 0,
            person_ids: Vec::new(),
            person_names: Vec::new(),
            matrix: Array2::zeros((0, EMBEDDING_DIM)),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.person_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.person_ids.is_empty()
    }

    /// 1-nearest-neighbor by inner product. Returns None on an empty index.
    /// Ties break to the lowest person id (rows are sorted; strict `>` keeps
    /// the first maximum).
    pub fn query(&self, embedding: &[f32]) -> Option<IndexMatch> {
        if self.is_empty() || embedding.len() != EMBEDDING_DIM {
            return None;
        }
        let q = ArrayView1::from(embedding);
        let mut best_row = 0usize;
        let mut best_sim = f32::NEG_INFINITY;
        for (row, vec) in self.matrix.outer_iter().enumerate() {
            let sim = vec.dot(&q);
            if sim > best_sim {
                best_sim = sim;
                best_row = row;
            }
        }
        Some(IndexMatch {
            person_id: self.person_ids[best_row].clone(),
            person_name: self.person_names[best_row].clone(),
            similarity: best_sim.clamp(-1.0, 1.0),
        })
    }
}

/// Outcome of a `reload` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Content hash matched the live snapshot; nothing changed.
    Unchanged { version: u64 },
    /// A new snapshot was published.
    Swapped { version: u64, rows: usize },
}

pub struct IdentityIndex {
    snapshot: RwLock<Arc<IndexSnapshot>>,
    /// Serializes concurrent reloads; never held while answering queries.
    reload_lock: Mutex<()>,
}

impl Default for IdentityIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(IndexSnapshot::empty())),
            reload_lock: Mutex::new(()),
        }
    }

    /// Pin the current snapshot (cheap: clone Arc, release lock).
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Atomically replace the index with a new catalog snapshot.
    ///
    /// Idempotent: identical content is a no-op and keeps the old version.
    /// A catalog older than the live snapshot is rejected; the caller must
    /// re-read from the control plane.
    pub fn reload(&self, catalog: &CatalogSnapshot) -> Result<ReloadOutcome, RecognitionError> {
        let _guard = self.reload_lock.lock().unwrap_or_else(|e| e.into_inner());

        let hash = content_hash(catalog);
        let current = self.snapshot();
        if hash == current.content_hash && !current.is_empty() {
            debug!(
                version = current.version,
                "Index reload skipped (content unchanged)"
            );
            return Ok(ReloadOutcome::Unchanged {
                version: current.version,
            });
        }
        if catalog.version < current.version {
            return Err(RecognitionError::VersionMismatch {
                current: current.version,
                requested: catalog.version,
            });
        }

        let next = build_snapshot(catalog, hash);
        let rows = next.len();
        let version = next.version;
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
        info!(version, rows, "Identity index swapped");
        Ok(ReloadOutcome::Swapped { version, rows })
    }
}

fn build_snapshot(catalog: &CatalogSnapshot, content_hash: u64) -> IndexSnapshot {
    // Inactive persons stay out of the index; their embeddings are retained
    // by the control plane but must not match.
    let mut rows: Vec<(&str, &str, &[f32])> = Vec::new();
    for emb in &catalog.embeddings {
        if emb.vector.len() != EMBEDDING_DIM {
            debug!(
                person_id = %emb.person_id,
                dims = emb.vector.len(),
                "Skipping embedding with wrong dimensionality"
            );
            continue;
        }
        let Some(person) = catalog.persons.iter().find(|p| p.id == emb.person_id) else {
            continue;
        };
        if person.status != PersonStatus::Active {
            continue;
        }
        rows.push((&person.id, &person.name, &emb.vector));
    }
    rows.sort_by(|a, b| a.0.cmp(b.0));

    let mut matrix = Array2::<f32>::zeros((rows.len(), EMBEDDING_DIM));
    let mut person_ids = Vec::with_capacity(rows.len());
    let mut person_names = Vec::with_capacity(rows.len());
    for (i, (id, name, vec)) in rows.iter().enumerate() {
        let mut row = matrix.row_mut(i);
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        let inv = if norm > f32::EPSILON { 1.0 / norm } else { 0.0 };
        for (j, v) in vec.iter().enumerate() {
            row[j] = v * inv;
        }
        person_ids.push(id.to_string());
        person_names.push(name.to_string());
    }

    IndexSnapshot {
        version: catalog.version,
        content_hash,
        person_ids,
        person_names,
        matrix,
    }
}

/// FNV-1a over the identity-relevant catalog content. Version is excluded so
/// a pure version bump with identical content stays a no-op.
fn content_hash(catalog: &CatalogSnapshot) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    let mut eat = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };

    let mut persons: Vec<_> = catalog.persons.iter().collect();
    persons.sort_by(|a, b| a.id.cmp(&b.id));
    for p in persons {
        eat(p.id.as_bytes());
        eat(p.name.as_bytes());
        eat(&[matches!(p.status, PersonStatus::Active) as u8]);
    }

    let mut embeddings: Vec<_> = catalog.embeddings.iter().collect();
    embeddings.sort_by(|a, b| a.person_id.cmp(&b.person_id));
    for e in embeddings {
        eat(e.person_id.as_bytes());
        for v in &e.vector {
            eat(&v.to_le_bytes());
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_protocol::{EmbeddingRecord, PersonSnapshot};

    fn unit_vec(hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[hot] = 1.0;
        v
    }

    fn person(id: &str, name: &str, status: PersonStatus) -> PersonSnapshot {
        PersonSnapshot {
            id: id.to_string(),
            name: name.to_string(),
            status,
        }
    }

    fn catalog(version: u64) -> CatalogSnapshot {
        CatalogSnapshot {
            version,
            persons: vec![
                person("p-1", "Ana", PersonStatus::Active),
                person("p-2", "Bruno", PersonStatus::Active),
            ],
            embeddings: vec![
                EmbeddingRecord {
                    person_id: "p-1".to_string(),
                    vector: unit_vec(0),
                    quality: 0.9,
                },
                EmbeddingRecord {
                    person_id: "p-2".to_string(),
                    vector: unit_vec(1),
                    quality: 0.8,
                },
            ],
        }
    }

    #[test]
    fn empty_index_returns_none() {
        let index = IdentityIndex::new();
        assert!(index.snapshot().query(&unit_vec(0)).is_none());
    }

    #[test]
    fn query_finds_nearest_neighbor() {
        let index = IdentityIndex::new();
        index.reload(&catalog(1)).unwrap();
        let snap = index.snapshot();

        let m = snap.query(&unit_vec(0)).unwrap();
        assert_eq!(m.person_id, "p-1");
        assert!((m.similarity - 1.0).abs() < 1e-6);

        let m = snap.query(&unit_vec(1)).unwrap();
        assert_eq!(m.person_id, "p-2");
    }

    #[test]
    fn tie_breaks_to_lowest_person_id() {
        let mut cat = catalog(1);
        // Both persons get the identical embedding
        cat.embeddings[1].vector = unit_vec(0);
        let index = IdentityIndex::new();
        index.reload(&cat).unwrap();
        let m = index.snapshot().query(&unit_vec(0)).unwrap();
        assert_eq!(m.person_id, "p-1");
    }

    #[test]
    fn inactive_person_is_not_matched() {
        let mut cat = catalog(1);
        cat.persons[0].status = PersonStatus::Inactive;
        let index = IdentityIndex::new();
        index.reload(&cat).unwrap();
        let snap = index.snapshot();
        assert_eq!(snap.len(), 1);
        let m = snap.query(&unit_vec(0)).unwrap();
        // Nearest remaining row is p-2, at similarity 0
        assert_eq!(m.person_id, "p-2");
        assert!(m.similarity < 0.5);
    }

    #[test]
    fn reload_same_content_is_noop() {
        let index = IdentityIndex::new();
        let out = index.reload(&catalog(5)).unwrap();
        assert_eq!(out, ReloadOutcome::Swapped { version: 5, rows: 2 });

        // Same content, even with a bumped version, keeps the old snapshot
        let out = index.reload(&catalog(6)).unwrap();
        assert_eq!(out, ReloadOutcome::Unchanged { version: 5 });
        assert_eq!(index.version(), 5);
    }

    #[test]
    fn reload_older_version_is_rejected() {
        let index = IdentityIndex::new();
        index.reload(&catalog(10)).unwrap();

        let mut stale = catalog(4);
        stale.persons[0].name = "Renamed".to_string();
        match index.reload(&stale) {
            Err(RecognitionError::VersionMismatch {
                current: 10,
                requested: 4,
            }) => {}
            other => panic!("expected VersionMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn readers_keep_pinned_snapshot_across_swap() {
        let index = IdentityIndex::new();
        index.reload(&catalog(1)).unwrap();
        let pinned = index.snapshot();

        let mut updated = catalog(2);
        updated.persons[0].name = "Ana Maria".to_string();
        index.reload(&updated).unwrap();

        // The pinned snapshot still answers with the old content
        assert_eq!(pinned.version(), 1);
        assert_eq!(pinned.query(&unit_vec(0)).unwrap().person_name, "Ana");
        // New readers see the swap
        assert_eq!(index.snapshot().version(), 2);
    }

    #[test]
    fn embeddings_are_normalized_on_load() {
        let mut cat = catalog(1);
        // Scaled vector must match exactly like a unit vector
        for v in &mut cat.embeddings[0].vector {
            *v *= 7.5;
        }
        let index = IdentityIndex::new();
        index.reload(&cat).unwrap();
        let m = index.snapshot().query(&unit_vec(0)).unwrap();
        assert_eq!(m.person_id, "p-1");
        assert!((m.similarity - 1.0).abs() < 1e-5);
    }

    #[test]
    fn wrong_dimensionality_is_skipped() {
        let mut cat = catalog(1);
        cat.embeddings[0].vector = vec![1.0; 128];
        let index = IdentityIndex::new();
        index.reload(&cat).unwrap();
        assert_eq!(index.snapshot().len(), 1);
    }
}
