//! Cache sizing for the vector index.

/// Capacities of the index's bounded caches, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct VectorIndexConfig {
    /// Memoized `forkless_cause(a, b)` pairs.
    pub forkless_cause_pairs: usize,
    /// Cached highest-before vectors.
    pub highest_before_entries: usize,
    /// Cached lowest-after vectors.
    pub lowest_after_entries: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        VectorIndexConfig {
            forkless_cause_pairs: 20_000,
            highest_before_entries: 20_000,
            lowest_after_entries: 20_000,
        }
    }
}

impl VectorIndexConfig {
    /// Scaled-down profile for tests.
    pub fn lite() -> Self {
        VectorIndexConfig {
            forkless_cause_pairs: 200,
            highest_before_entries: 200,
            lowest_after_entries: 200,
        }
    }
}
