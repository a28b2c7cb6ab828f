//! Unknown-face bookkeeping.
//!
//! Faces that miss the identity index are tracked per camera as short-lived
//! candidates, clustered by embedding distance. A candidate that stays
//! present, large, and sharp long enough is admitted exactly once per
//! cooldown window; admissions outlive candidate eviction so a person who
//! leaves and returns within the cooldown is not re-admitted.
//!
//! All methods take an explicit `now` so the rules are testable without
//! sleeping.

use std::time::{Duration, Instant};

use tracing::{debug, info};
use vigil_protocol::{BoundingBox, UnknownConfig};

/// One observation of an unmatched face.
pub struct Observation<'a> {
    /// L2-normalized embedding
    pub embedding: &'a [f32],
    pub bbox: BoundingBox,
    pub quality: f32,
}

/// Emitted when a candidate satisfies the admission rules.
#[derive(Debug, Clone)]
pub struct Admission {
    pub cluster_id: u64,
    /// Latest embedding of the candidate at admission time
    pub embedding: Vec<f32>,
    /// Best quality seen across the candidate's lifetime
    pub quality: f32,
    /// Box of the observation that triggered admission
    pub bbox: BoundingBox,
}

struct Candidate {
    cluster_id: u64,
    first_seen: Instant,
    last_seen: Instant,
    frames: u32,
    max_quality: f32,
    embedding: Vec<f32>,
}

/// Remembered admission; survives candidate eviction for the cooldown.
struct RecentAdmission {
    embedding: Vec<f32>,
    admitted_at: Instant,
}

pub struct UnknownPolicy {
    cfg: UnknownConfig,
    candidates: Vec<Candidate>,
    recent: Vec<RecentAdmission>,
    next_cluster_id: u64,
}

impl UnknownPolicy {
    pub fn new(cfg: UnknownConfig) -> Self {
        Self {
            cfg,
            candidates: Vec::new(),
            recent: Vec::new(),
            next_cluster_id: 0,
        }
    }

    /// Record one unmatched face; returns an admission when the thresholds
    /// are first satisfied for its cluster.
    pub fn observe(&mut self, obs: Observation<'_>, now: Instant) -> Option<Admission> {
        self.evict(now);

        let idx = match self.nearest_candidate(obs.embedding) {
            Some(idx) => {
                let c = &mut self.candidates[idx];
                c.last_seen = now;
                c.frames += 1;
                if obs.quality > c.max_quality {
                    c.max_quality = obs.quality;
                }
                c.embedding = obs.embedding.to_vec();
                idx
            }
            None => {
                let cluster_id = self.next_cluster_id;
                self.next_cluster_id += 1;
                debug!(cluster_id, "New unknown candidate");
                self.candidates.push(Candidate {
                    cluster_id,
                    first_seen: now,
                    last_seen: now,
                    frames: 1,
                    max_quality: obs.quality,
                    embedding: obs.embedding.to_vec(),
                });
                self.candidates.len() - 1
            }
        };

        let c = &self.candidates[idx];
        if !self.admissible(c, &obs, now) {
            return None;
        }
        if self.in_cooldown(obs.embedding, now) {
            return None;
        }

        let admission = Admission {
            cluster_id: c.cluster_id,
            embedding: c.embedding.clone(),
            quality: c.max_quality,
            bbox: obs.bbox,
        };
        info!(
            cluster_id = admission.cluster_id,
            quality = admission.quality,
            frames = c.frames,
            "Unknown face admitted"
        );
        self.recent.push(RecentAdmission {
            embedding: c.embedding.clone(),
            admitted_at: now,
        });
        Some(admission)
    }

    /// Number of candidates currently tracked.
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    fn admissible(&self, c: &Candidate, obs: &Observation<'_>, now: Instant) -> bool {
        now.duration_since(c.first_seen) >= Duration::from_millis(self.cfg.min_presence_ms)
            && c.frames >= self.cfg.min_frames
            && obs.bbox.w >= self.cfg.min_face_px
            && obs.bbox.h >= self.cfg.min_face_px
            && c.max_quality >= self.cfg.min_quality
    }

    fn in_cooldown(&self, embedding: &[f32], now: Instant) -> bool {
        let cooldown = Duration::from_millis(self.cfg.cooldown_ms);
        self.recent.iter().any(|r| {
            now.duration_since(r.admitted_at) < cooldown
                && cosine_distance(&r.embedding, embedding) < self.cfg.cluster_dist
        })
    }

    fn nearest_candidate(&self, embedding: &[f32]) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (idx, c) in self.candidates.iter().enumerate() {
            let dist = cosine_distance(&c.embedding, embedding);
            if dist < self.cfg.cluster_dist && best.map(|(_, d)| dist < d).unwrap_or(true) {
                best = Some((idx, dist));
            }
        }
        best.map(|(idx, _)| idx)
    }

    fn evict(&mut self, now: Instant) {
        let idle = Duration::from_millis(self.cfg.idle_ms);
        let before = self.candidates.len();
        self.candidates
            .retain(|c| now.duration_since(c.last_seen) < idle);
        if self.candidates.len() < before {
            debug!(evicted = before - self.candidates.len(), "Idle candidates dropped");
        }
        let cooldown = Duration::from_millis(self.cfg.cooldown_ms);
        self.recent
            .retain(|r| now.duration_since(r.admitted_at) < cooldown);
    }
}

/// Cosine distance for L2-normalized vectors: 1 - dot.
pub(crate) fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 2.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    1.0 - dot
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 512;

    fn cfg() -> UnknownConfig {
        UnknownConfig {
            cluster_dist: 0.4,
            min_presence_ms: 2000,
            min_frames: 10,
            min_face_px: 80,
            min_quality: 0.5,
            cooldown_ms: 60_000,
            idle_ms: 5000,
        }
    }

    fn unit(hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; DIM];
        v[hot] = 1.0;
        v
    }

    fn big_box() -> BoundingBox {
        BoundingBox {
            x: 100,
            y: 80,
            w: 120,
            h: 140,
        }
    }

    fn observe_face(
        policy: &mut UnknownPolicy,
        embedding: &[f32],
        quality: f32,
        now: Instant,
    ) -> Option<Admission> {
        policy.observe(
            Observation {
                embedding,
                bbox: big_box(),
                quality,
            },
            now,
        )
    }

    /// Feed `n` observations at ~10 fps starting at `start`; returns
    /// admissions in order.
    fn run_presence(
        policy: &mut UnknownPolicy,
        embedding: &[f32],
        quality: f32,
        start: Instant,
        n: u32,
    ) -> Vec<Admission> {
        (0..n)
            .filter_map(|i| {
                let now = start + Duration::from_millis(100 * i as u64);
                observe_face(policy, embedding, quality, now)
            })
            .collect()
    }

    #[test]
    fn admission_after_presence_and_frames() {
        let mut policy = UnknownPolicy::new(cfg());
        let start = Instant::now();
        // 3 seconds at 10 fps, quality 0.7, 120x140 face
        let admissions = run_presence(&mut policy, &unit(0), 0.7, start, 30);
        assert_eq!(admissions.len(), 1, "exactly one admission");
        assert_eq!(admissions[0].cluster_id, 0);
        assert!((admissions[0].quality - 0.7).abs() < 1e-6);
    }

    #[test]
    fn no_admission_below_min_presence() {
        let mut policy = UnknownPolicy::new(cfg());
        let start = Instant::now();
        // 1.5 seconds: enough frames (15 > 10) but not enough presence
        let admissions = run_presence(&mut policy, &unit(0), 0.7, start, 15);
        assert!(admissions.is_empty());
    }

    #[test]
    fn no_admission_below_min_frames() {
        let mut p = UnknownPolicy::new(UnknownConfig {
            min_frames: 50,
            ..cfg()
        });
        let start = Instant::now();
        let admissions = run_presence(&mut p, &unit(0), 0.7, start, 30);
        assert!(admissions.is_empty());
    }

    #[test]
    fn no_admission_for_small_face() {
        let mut policy = UnknownPolicy::new(cfg());
        let start = Instant::now();
        let emb = unit(0);
        for i in 0..30 {
            let now = start + Duration::from_millis(100 * i);
            let out = policy.observe(
                Observation {
                    embedding: &emb,
                    bbox: BoundingBox {
                        x: 0,
                        y: 0,
                        w: 60,
                        h: 60,
                    },
                    quality: 0.7,
                },
                now,
            );
            assert!(out.is_none());
        }
    }

    #[test]
    fn no_admission_below_quality() {
        let mut policy = UnknownPolicy::new(cfg());
        let start = Instant::now();
        let admissions = run_presence(&mut policy, &unit(0), 0.3, start, 30);
        assert!(admissions.is_empty());
    }

    #[test]
    fn cooldown_suppresses_reappearance() {
        let mut policy = UnknownPolicy::new(cfg());
        let start = Instant::now();
        let admissions = run_presence(&mut policy, &unit(0), 0.7, start, 30);
        assert_eq!(admissions.len(), 1);

        // Candidate is evicted during 30 s away, but the admission memory
        // must still suppress a second event inside the 60 s cooldown.
        let comeback = start + Duration::from_secs(30);
        let admissions = run_presence(&mut policy, &unit(0), 0.7, comeback, 30);
        assert!(admissions.is_empty(), "re-admitted within cooldown");
    }

    #[test]
    fn admission_allowed_after_cooldown_expires() {
        let mut policy = UnknownPolicy::new(cfg());
        let start = Instant::now();
        assert_eq!(run_presence(&mut policy, &unit(0), 0.7, start, 30).len(), 1);

        let later = start + Duration::from_secs(90);
        let admissions = run_presence(&mut policy, &unit(0), 0.7, later, 30);
        assert_eq!(admissions.len(), 1, "cooldown expired, admission allowed");
    }

    #[test]
    fn distinct_embeddings_form_distinct_clusters() {
        let mut policy = UnknownPolicy::new(cfg());
        let start = Instant::now();
        let a = unit(0);
        let b = unit(1); // orthogonal: distance 1.0 > cluster_dist
        for i in 0..30u64 {
            let now = start + Duration::from_millis(100 * i);
            observe_face(&mut policy, &a, 0.7, now);
            observe_face(&mut policy, &b, 0.7, now);
        }
        assert_eq!(policy.candidate_count(), 2);
    }

    #[test]
    fn near_embeddings_share_a_cluster() {
        let mut policy = UnknownPolicy::new(cfg());
        let start = Instant::now();
        let a = unit(0);
        // Slightly rotated copy of `a`: cosine distance well under 0.4
        let mut b = unit(0);
        b[1] = 0.3;
        crate::embed::l2_normalize(&mut b);

        observe_face(&mut policy, &a, 0.7, start);
        observe_face(&mut policy, &b, 0.7, start + Duration::from_millis(100));
        assert_eq!(policy.candidate_count(), 1);
    }

    #[test]
    fn idle_candidates_are_evicted() {
        let mut policy = UnknownPolicy::new(cfg());
        let start = Instant::now();
        observe_face(&mut policy, &unit(0), 0.7, start);
        assert_eq!(policy.candidate_count(), 1);

        // 6 s of absence exceeds idle_ms = 5000
        observe_face(&mut policy, &unit(1), 0.7, start + Duration::from_secs(6));
        assert_eq!(policy.candidate_count(), 1);
    }

    #[test]
    fn eviction_resets_presence_clock() {
        let mut policy = UnknownPolicy::new(cfg());
        let start = Instant::now();
        // Present 1 s, away 6 s (evicted), back: presence restarts
        run_presence(&mut policy, &unit(0), 0.7, start, 10);
        let back = start + Duration::from_secs(7);
        let admissions = run_presence(&mut policy, &unit(0), 0.7, back, 15);
        assert!(admissions.is_empty(), "presence must restart after eviction");
    }

    #[test]
    fn max_quality_is_retained_across_updates() {
        let mut policy = UnknownPolicy::new(cfg());
        let start = Instant::now();
        let emb = unit(0);
        // Good quality early, mediocre at admission time: max wins
        observe_face(&mut policy, &emb, 0.9, start);
        let mut admission = None;
        for i in 1..30u64 {
            let now = start + Duration::from_millis(100 * i);
            if let Some(a) = observe_face(&mut policy, &emb, 0.55, now) {
                admission = Some(a);
                break;
            }
        }
        let admission = admission.expect("admission expected");
        assert!((admission.quality - 0.9).abs() < 1e-6);
    }

    #[test]
    fn cosine_distance_basics() {
        let a = unit(0);
        let b = unit(1);
        assert!((cosine_distance(&a, &a) - 0.0).abs() < 1e-6);
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&a, &b[..10]), 2.0);
    }
}
