//! Random seed provider.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Provider trait for random number generation.
pub trait RngProvider: Send + Sync {
    /// Generate a random u64.
    fn next_u64(&self) -> u64;

    /// Check if this is a mock provider.
    fn is_mock(&self) -> bool;
}

/// Real RNG seeded from the operating system's entropy source.
pub struct RealRng {
    rng: Mutex<StdRng>,
}

impl RealRng {
    /// Create a new real RNG.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl Default for RealRng {
    fn default() -> Self {
        Self::new()
    }
}

impl RngProvider for RealRng {
    fn next_u64(&self) -> u64 {
        self.rng.lock().r#gen()
    }

    fn is_mock(&self) -> bool {
        false
    }
}

/// Mock RNG with a fixed seed for deterministic behavior.
///
/// # Example
///
/// ```
/// use hydra_core::providers::{MockRng, RngProvider};
///
/// let rng = MockRng::seeded(42);
/// let first = rng.next_u64();
///
/// let rng2 = MockRng::seeded(42);
/// assert_eq!(rng2.next_u64(), first);
/// ```
pub struct MockRng {
    rng: Mutex<StdRng>,
    seed: u64,
}

impl MockRng {
    /// Create a new mock RNG with the given seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            seed,
        }
    }

    /// Get the seed used to create this RNG.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Reset the RNG to its initial state.
    pub fn reset(&self) {
        *self.rng.lock() = StdRng::seed_from_u64(self.seed);
    }
}

impl RngProvider for MockRng {
    fn next_u64(&self) -> u64 {
        self.rng.lock().r#gen()
    }

    fn is_mock(&self) -> bool {
        true
    }
}
