//! Count-Min Sketch
//!
//! Fixed-size frequency estimator over byte volumes. `depth` rows of `width`
//! counters live in one flat buffer of atomics addressed by `(row, column)`,
//! so updates never allocate and never take a lock.
//!
//! Every row has its own independently seeded hasher. The estimate for a key
//! is the minimum of its counters across rows, which never undercounts; with
//! total traffic `N` it overcounts by more than `(e / width) * N` with
//! probability at most `e^-depth`.

use ahash::RandomState;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// How counters shrink on decay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayMode {
    /// Halve every counter, keeping a geometrically fading history
    #[default]
    Halve,

    /// Zero every counter
    Reset,
}

/// Count-min sketch with atomic counters
#[derive(Debug)]
pub struct CountMinSketch {
    width: usize,
    depth: usize,
    hashers: Box<[RandomState]>,
    cells: Box<[AtomicU64]>,
    total: AtomicU64,
}

/// splitmix64 step, used to expand one seed into per-row hasher keys
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl CountMinSketch {
    /// Create a sketch with randomly seeded rows
    ///
    /// # Panics
    ///
    /// Panics if `width` or `depth` is zero. Policies are validated before a
    /// sketch is built.
    pub fn new(width: usize, depth: usize) -> Self {
        Self::with_seed(width, depth, rand::random())
    }

    /// Create a sketch whose row hashers derive deterministically from `seed`
    ///
    /// # Panics
    ///
    /// Panics if `width` or `depth` is zero.
    pub fn with_seed(width: usize, depth: usize, seed: u64) -> Self {
        assert!(width > 0 && depth > 0, "sketch dimensions must be positive");

        let mut state = seed;
        let hashers = (0..depth)
            .map(|_| {
                RandomState::with_seeds(
                    splitmix64(&mut state),
                    splitmix64(&mut state),
                    splitmix64(&mut state),
                    splitmix64(&mut state),
                )
            })
            .collect();
        let cells = (0..width * depth).map(|_| AtomicU64::new(0)).collect();

        Self {
            width,
            depth,
            hashers,
            cells,
            total: AtomicU64::new(0),
        }
    }

    /// Counters per row
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of rows
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Bytes recorded since creation, decayed alongside the counters
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Additive error bound `(e / width) * total` for the current contents
    pub fn error_bound(&self) -> f64 {
        std::f64::consts::E / self.width as f64 * self.total() as f64
    }

    #[inline]
    fn index<K: Hash + ?Sized>(&self, row: usize, key: &K) -> usize {
        let hash = self.hashers[row].hash_one(key);
        // multiply-shift maps the full 64-bit hash onto [0, width)
        let column = ((u128::from(hash) * self.width as u128) >> 64) as usize;
        row * self.width + column
    }

    /// Add `bytes` to every row's counter for `key`
    ///
    /// Counters saturate instead of wrapping.
    pub fn update<K: Hash + ?Sized>(&self, key: &K, bytes: u64) {
        if bytes == 0 {
            return;
        }
        for row in 0..self.depth {
            saturating_add(&self.cells[self.index(row, key)], bytes);
        }
        saturating_add(&self.total, bytes);
    }

    /// Estimated bytes for `key`; never below the true count
    pub fn estimate<K: Hash + ?Sized>(&self, key: &K) -> u64 {
        (0..self.depth)
            .map(|row| self.cells[self.index(row, key)].load(Ordering::Relaxed))
            .min()
            .unwrap_or(0)
    }

    /// Shrink every counter
    ///
    /// Each cell is rewritten with its own atomic read-modify-write, so
    /// concurrent updates are never corrupted. In `Reset` mode an update that
    /// lands between a cell being cleared and the next decay survives; one
    /// racing the clear of its own cell may be lost.
    pub fn decay(&self, mode: DecayMode) {
        for cell in self.cells.iter().chain(std::iter::once(&self.total)) {
            match mode {
                DecayMode::Halve => {
                    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v >> 1));
                }
                DecayMode::Reset => {
                    cell.store(0, Ordering::Relaxed);
                }
            }
        }
    }
}

#[inline]
fn saturating_add(cell: &AtomicU64, bytes: u64) {
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_add(bytes))
    });
}
