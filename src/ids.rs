use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use ulid::{Generator, Ulid};

/// Source of every id the engine assigns (groups, events, series).
/// Passed into the engine explicitly so tests can make ids predictable.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> Ulid;
}

/// Monotonic ULIDs: ids assigned within one millisecond still sort in
/// assignment order.
pub struct MonotonicUlids {
    generator: Mutex<Generator>,
}

impl MonotonicUlids {
    pub fn new() -> Self {
        Self {
            generator: Mutex::new(Generator::new()),
        }
    }
}

impl Default for MonotonicUlids {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for MonotonicUlids {
    fn next_id(&self) -> Ulid {
        let generated = match self.generator.lock() {
            Ok(mut g) => g.generate().ok(),
            Err(poisoned) => poisoned.into_inner().generate().ok(),
        };
        // Random-part overflow within one millisecond; a fresh id still sorts after.
        generated.unwrap_or_else(Ulid::new)
    }
}

/// Deterministic ids: fixed timestamp, counting random part.
pub struct SequentialIds {
    timestamp_ms: u64,
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            counter: AtomicU64::new(1),
        }
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> Ulid {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ulid::from_parts(self.timestamp_ms, n as u128)
    }
}

/// Dark `#rrggbb` colour (each channel below 0x80) derived from an id's random
/// bits, so colour assignment follows whatever [`IdSource`] is in use.
/// Successive `attempt`s give the re-rolls used when a colour is taken.
pub fn dark_color(id: Ulid, attempt: u32) -> String {
    let bits = id.random() ^ u128::from(attempt).wrapping_mul(0x9e37_79b9_7f4a_7c15_f39c_c060_5ced_c835);
    let mix = (bits ^ (bits >> 24) ^ (bits >> 48)) as u32;
    let r = mix & 0x7f;
    let g = (mix >> 8) & 0x7f;
    let b = (mix >> 16) & 0x7f;
    format!("#{r:02x}{g:02x}{b:02x}")
}
