//! Sticky variant assignment.
//!
//! A session is bucketed once per experiment and the result is kept in a
//! [`SessionStore`]; every later request for the same experiment returns the
//! stored variant. Bucketing draws a value in `[0, 100)` from a
//! [`BucketSource`] and routes to the secondary variant when the draw falls
//! below the traffic split.

use std::collections::HashMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::config::Experiment;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub test_id: String,
    pub session_id: String,
    pub variant_id: String,
    pub assigned_at: i64,
}

/// Key under which a client persists its assignment for `test_id`.
pub fn storage_key(test_id: &str) -> String {
    format!("ab_test_{test_id}")
}

/// Where a session keeps its sticky assignments, one per experiment.
pub trait SessionStore {
    fn get(&self, test_id: &str) -> Option<Assignment>;
    fn set(&mut self, test_id: &str, assignment: Assignment);
}

/// A single session's assignments, keyed by [`storage_key`].
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    entries: HashMap<String, Assignment>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, test_id: &str) -> Option<Assignment> {
        self.entries.get(&storage_key(test_id)).cloned()
    }

    fn set(&mut self, test_id: &str, assignment: Assignment) {
        self.entries.insert(storage_key(test_id), assignment);
    }
}

/// Produces bucketing draws in `[0, 100)`.
pub trait BucketSource: Send {
    fn draw(&mut self, test_id: &str, session_id: &str) -> f64;
}

/// Uniform random draws. Seed it for reproducible sequences.
pub struct RandomBucket<R> {
    rng: R,
}

impl<R: Rng + Send> RandomBucket<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl RandomBucket<StdRng> {
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl<R: Rng + Send> BucketSource for RandomBucket<R> {
    fn draw(&mut self, _test_id: &str, _session_id: &str) -> f64 {
        self.rng.gen_range(0.0..100.0)
    }
}

/// Deterministic draws from MurmurHash3 of `"<test_id>:<session_id>"`, so the
/// same session lands in the same bucket on every node and after restarts.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashBucket;

impl BucketSource for HashBucket {
    fn draw(&mut self, test_id: &str, session_id: &str) -> f64 {
        let key = format!("{}:{}", test_id, session_id);
        let (h1, _) = murmurhash3_128(key.as_bytes(), 0);
        (h1 % 10_000) as f64 / 100.0
    }
}

/// Picks the variant for a fresh draw. `split` is clamped to `[0, 100]`.
pub fn bucket_variant<'a>(experiment: &'a Experiment, split: f64, draw: f64) -> &'a str {
    let split = split.clamp(0.0, 100.0);
    if draw < split {
        &experiment.secondary_variant().id
    } else {
        &experiment.primary_variant().id
    }
}

/// Returns the session's sticky variant, bucketing and persisting it on first
/// use. When `enabled` is false the primary variant is returned and nothing
/// is stored.
pub fn assign(
    experiment: &Experiment,
    session_id: &str,
    split: f64,
    enabled: bool,
    sessions: &mut dyn SessionStore,
    source: &mut dyn BucketSource,
) -> String {
    if !enabled {
        return experiment.primary_variant().id.clone();
    }
    if let Some(existing) = sessions.get(&experiment.id) {
        return existing.variant_id;
    }
    let draw = source.draw(&experiment.id, session_id);
    let variant_id = bucket_variant(experiment, split, draw).to_string();
    sessions.set(
        &experiment.id,
        Assignment {
            test_id: experiment.id.clone(),
            session_id: session_id.to_string(),
            variant_id: variant_id.clone(),
            assigned_at: super::now_ms(),
        },
    );
    variant_id
}

/// Client-side entry point: uses the experiment's own split, and only buckets
/// while the experiment is active.
pub fn assign_variant(
    experiment: &Experiment,
    session_id: &str,
    sessions: &mut dyn SessionStore,
    source: &mut dyn BucketSource,
) -> String {
    let enabled = experiment.status == super::config::ExperimentStatus::Active;
    assign(
        experiment,
        session_id,
        experiment.traffic_split,
        enabled,
        sessions,
        source,
    )
}

/// Server-side mirror of the assignments handed out by this process, keyed by
/// (test id, session id).
#[derive(Default)]
pub struct AssignmentTable {
    entries: DashMap<(String, String), Assignment>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, test_id: &str, session_id: &str) -> Option<Assignment> {
        self.entries
            .get(&(test_id.to_string(), session_id.to_string()))
            .map(|a| a.value().clone())
    }

    /// Returns the stored assignment, or draws and records one. Concurrent
    /// first calls for the same key observe a single winner.
    pub fn get_or_assign(
        &self,
        experiment: &Experiment,
        session_id: &str,
        draw: impl FnOnce() -> f64,
    ) -> Assignment {
        let key = (experiment.id.clone(), session_id.to_string());
        match self.entries.entry(key) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let variant_id =
                    bucket_variant(experiment, experiment.traffic_split, draw()).to_string();
                let assignment = Assignment {
                    test_id: experiment.id.clone(),
                    session_id: session_id.to_string(),
                    variant_id,
                    assigned_at: super::now_ms(),
                };
                slot.insert(assignment.clone());
                assignment
            }
        }
    }

    /// Drops every assignment for `test_id`, returning how many were held.
    pub fn evict_test(&self, test_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(t, _), _| t != test_id);
        before - self.entries.len()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn mix_k1(k1: u64) -> u64 {
    k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2)
}

fn mix_k2(k2: u64) -> u64 {
    k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1)
}

const C1: u64 = 0x87c37b91114253d5;
const C2: u64 = 0x4cf5ad432745937f;

/// MurmurHash3_x64_128. Returns (h1, h2); h1 is used for bucketing.
pub(crate) fn murmurhash3_128(data: &[u8], seed: u64) -> (u64, u64) {
    let len = data.len();
    let mut h1 = seed;
    let mut h2 = seed;

    let mut blocks = data.chunks_exact(16);
    for block in &mut blocks {
        h1 ^= mix_k1(read_u64_le(&block[..8]));
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dce729);

        h2 ^= mix_k2(read_u64_le(&block[8..]));
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x38495ab5);
    }

    // Tail bytes are read little-endian, zero-padded.
    let tail = blocks.remainder();
    if tail.len() > 8 {
        h2 ^= mix_k2(read_u64_le(&tail[8..]));
    }
    if !tail.is_empty() {
        h1 ^= mix_k1(read_u64_le(&tail[..tail.len().min(8)]));
    }

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    (h1, h2)
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51afd7ed558ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ceb9fe1a85ec53);
    k ^= k >> 33;
    k
}
