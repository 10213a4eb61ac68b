//! Clock and randomness providers.
//!
//! Mutations capture a timestamp and a random seed when they are logged. Both
//! come from these providers so tests can pin them and replicas replaying the
//! log observe the captured values instead of reading their own clocks.

mod clock;
mod rng;

pub use clock::{ClockProvider, MockClock, RealClock};
pub use rng::{MockRng, RealRng, RngProvider};
