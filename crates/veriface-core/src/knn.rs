//! k-nearest-neighbour search over binary descriptors.
//!
//! Strategies share one result type and are tried in order by
//! [`MatchStrategies`] until one completes without a fault.

use crate::types::Descriptor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use thiserror::Error;

const LSH_SEED: u64 = 0x15E1_0CA1;
/// Keys are packed into a `u32`.
const LSH_MAX_KEY_BITS: usize = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("train descriptor set is empty")]
    EmptyTrainSet,
    #[error("k must be at least 1")]
    InvalidK,
    #[error("invalid index parameters: {0}")]
    InvalidIndex(String),
    #[error("no matching strategy configured")]
    NoStrategy,
}

/// One neighbour of a query descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor {
    pub train_idx: usize,
    pub distance: u32,
}

/// For every query descriptor, up to `k` nearest train descriptors by Hamming
/// distance, closest first.
pub type KnnMatches = Vec<Vec<Neighbor>>;

pub trait KnnMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn knn_match(
        &self,
        query: &[Descriptor],
        train: &[Descriptor],
        k: usize,
    ) -> Result<KnnMatches, MatchError>;
}

/// Exact search: every query against every train descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct BruteForceMatcher;

impl KnnMatcher for BruteForceMatcher {
    fn name(&self) -> &'static str {
        "brute_force"
    }

    fn knn_match(
        &self,
        query: &[Descriptor],
        train: &[Descriptor],
        k: usize,
    ) -> Result<KnnMatches, MatchError> {
        if k == 0 {
            return Err(MatchError::InvalidK);
        }
        Ok(query
            .iter()
            .map(|q| nearest(q, train, 0..train.len(), k))
            .collect())
    }
}

/// Multi-probe locality-sensitive hashing.
///
/// Each table hashes a descriptor by a fixed random subset of its bits. A
/// query probes its own bucket and every bucket one bit-flip away in each
/// table; queries that gather fewer than `k` candidates fall back to a linear
/// scan so they still report `k` neighbours.
#[derive(Debug, Clone)]
pub struct LshMatcher {
    pub tables: usize,
    pub key_bits: usize,
    pub multi_probe: bool,
}

impl Default for LshMatcher {
    fn default() -> Self {
        Self {
            tables: 6,
            key_bits: 12,
            multi_probe: true,
        }
    }
}

struct LshTable {
    bits: Vec<usize>,
    buckets: HashMap<u32, Vec<usize>>,
}

impl LshTable {
    fn key(&self, d: &Descriptor) -> u32 {
        self.bits
            .iter()
            .enumerate()
            .fold(0u32, |key, (i, &bit)| key | (u32::from(d.bit(bit)) << i))
    }
}

impl LshMatcher {
    fn build(&self, train: &[Descriptor]) -> Result<Vec<LshTable>, MatchError> {
        if self.tables == 0 {
            return Err(MatchError::InvalidIndex("at least one table is required".into()));
        }
        if self.key_bits == 0 || self.key_bits > LSH_MAX_KEY_BITS {
            return Err(MatchError::InvalidIndex(format!(
                "key size {} outside 1..={LSH_MAX_KEY_BITS}",
                self.key_bits
            )));
        }

        let mut rng = StdRng::seed_from_u64(LSH_SEED);
        let tables = (0..self.tables)
            .map(|_| {
                let bits = rand::seq::index::sample(&mut rng, Descriptor::BITS, self.key_bits).into_vec();
                let mut table = LshTable {
                    bits,
                    buckets: HashMap::new(),
                };
                for (idx, d) in train.iter().enumerate() {
                    let key = table.key(d);
                    table.buckets.entry(key).or_default().push(idx);
                }
                table
            })
            .collect();
        Ok(tables)
    }
}

impl KnnMatcher for LshMatcher {
    fn name(&self) -> &'static str {
        "lsh"
    }

    fn knn_match(
        &self,
        query: &[Descriptor],
        train: &[Descriptor],
        k: usize,
    ) -> Result<KnnMatches, MatchError> {
        if k == 0 {
            return Err(MatchError::InvalidK);
        }
        if train.is_empty() {
            return Err(MatchError::EmptyTrainSet);
        }
        let tables = self.build(train)?;

        let mut seen = vec![false; train.len()];
        let mut candidates = Vec::new();
        let mut scanned = 0usize;

        let matches = query
            .iter()
            .map(|q| {
                candidates.clear();
                seen.iter_mut().for_each(|s| *s = false);

                for table in &tables {
                    let key = table.key(q);
                    let flips = if self.multi_probe { self.key_bits } else { 0 };
                    let probes = std::iter::once(key).chain((0..flips).map(|b| key ^ (1 << b)));
                    for probe in probes {
                        for &idx in table.buckets.get(&probe).into_iter().flatten() {
                            if !seen[idx] {
                                seen[idx] = true;
                                candidates.push(idx);
                            }
                        }
                    }
                }

                if candidates.len() < k.min(train.len()) {
                    scanned += 1;
                    nearest(q, train, 0..train.len(), k)
                } else {
                    nearest(q, train, candidates.iter().copied(), k)
                }
            })
            .collect();

        tracing::trace!(queries = query.len(), scanned, "lsh search complete");
        Ok(matches)
    }
}

/// k nearest among `candidates`, ties broken by train index.
fn nearest(
    q: &Descriptor,
    train: &[Descriptor],
    candidates: impl Iterator<Item = usize>,
    k: usize,
) -> Vec<Neighbor> {
    let mut found: Vec<Neighbor> = candidates
        .map(|idx| Neighbor {
            train_idx: idx,
            distance: q.hamming(&train[idx]),
        })
        .collect();
    found.sort_unstable_by_key(|n| (n.distance, n.train_idx));
    found.truncate(k);
    found
}

/// Ordered fallback chain of k-NN strategies.
pub struct MatchStrategies {
    strategies: Vec<Box<dyn KnnMatcher>>,
}

impl Default for MatchStrategies {
    /// Approximate search first, exact search as the fallback.
    fn default() -> Self {
        Self::new(vec![Box::new(LshMatcher::default()), Box::new(BruteForceMatcher)])
    }
}

impl MatchStrategies {
    pub fn new(strategies: Vec<Box<dyn KnnMatcher>>) -> Self {
        Self { strategies }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run strategies in order; the first non-fault result wins.
    pub fn knn_match(
        &self,
        query: &[Descriptor],
        train: &[Descriptor],
        k: usize,
    ) -> Result<(&'static str, KnnMatches), MatchError> {
        let mut last_err = MatchError::NoStrategy;
        for strategy in &self.strategies {
            match strategy.knn_match(query, train, k) {
                Ok(matches) => return Ok((strategy.name(), matches)),
                Err(e) => {
                    tracing::warn!(strategy = strategy.name(), error = %e, "k-NN strategy failed, trying next");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

/// Count query descriptors whose nearest neighbour passes the ratio test
/// `d1 < ratio * d2`. Queries with fewer than two neighbours are ambiguous
/// and never count.
pub fn count_good_matches(matches: &[Vec<Neighbor>], ratio: f32) -> usize {
    matches
        .iter()
        .filter(|pair| match pair.as_slice() {
            [first, second, ..] => (first.distance as f32) < ratio * second.distance as f32,
            _ => false,
        })
        .count()
}
