// Small PRNG for backoff delays and exchange ids.
//
// xoshiro256++ seeded through SplitMix64, hand-rolled so the protocol crate
// does not pull in an RNG dependency. `Jitter::new(seed)` is deterministic,
// which the arbiter tests rely on; `Jitter::from_entropy()` mixes the clock
// with a process-wide counter so two connections opened in the same instant
// still draw different backoff sequences.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static SEED_COUNTER: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

#[derive(Clone, Debug)]
pub struct Jitter {
    s: [u64; 4],
}

impl Jitter {
    pub fn new(seed: u64) -> Self {
        let mut sm = seed;
        Self {
            s: [
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
            ],
        }
    }

    /// Seed from the wall clock and a per-process counter.
    pub fn from_entropy() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let salt = SEED_COUNTER.fetch_add(0x6A09_E667_F3BC_C909, Ordering::Relaxed);
        Self::new(nanos ^ salt.rotate_left(17))
    }

    pub fn next_u64(&mut self) -> u64 {
        let result = (self.s[0].wrapping_add(self.s[3]))
            .rotate_left(23)
            .wrapping_add(self.s[0]);
        let t = self.s[1] << 17;
        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];
        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);
        result
    }

    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform integer in `[0, bound]`, rejection-sampled to avoid modulo
    /// bias.
    pub fn up_to(&mut self, bound: u64) -> u64 {
        if bound == u64::MAX {
            return self.next_u64();
        }
        let range = bound + 1;
        let threshold = range.wrapping_neg() % range;
        loop {
            let r = self.next_u64();
            if r >= threshold {
                return r % range;
            }
        }
    }

    /// Uniform delay in `[0, max]` at millisecond resolution.
    pub fn delay_up_to(&mut self, max: Duration) -> Duration {
        let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(self.up_to(max_ms))
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Jitter::new(99);
        let mut b = Jitter::new(99);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn delays_stay_in_range_and_cover_it() {
        let mut rng = Jitter::new(7);
        let max = Duration::from_millis(1000);
        let mut low = false;
        let mut high = false;
        for _ in 0..10_000 {
            let d = rng.delay_up_to(max);
            assert!(d <= max);
            low |= d < Duration::from_millis(100);
            high |= d > Duration::from_millis(900);
        }
        assert!(low && high, "delays should spread over the whole window");
    }

    #[test]
    fn zero_window_is_always_zero() {
        let mut rng = Jitter::new(1);
        assert_eq!(rng.delay_up_to(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn entropy_seeds_differ() {
        let mut a = Jitter::from_entropy();
        let mut b = Jitter::from_entropy();
        assert_ne!(a.next_u64(), b.next_u64());
    }
}
