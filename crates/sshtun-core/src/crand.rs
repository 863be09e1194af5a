//! Process-global cryptographically seeded random source.
//!
//! Helper upload names must never collide between tunnels that generate
//! them concurrently, so the generator is a single mutex-guarded CSPRNG
//! shared by the whole process rather than a per-call thread RNG.

use std::sync::{Mutex, OnceLock};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

static SOURCE: OnceLock<Mutex<StdRng>> = OnceLock::new();

fn source() -> &'static Mutex<StdRng> {
    SOURCE.get_or_init(|| Mutex::new(StdRng::from_entropy()))
}

/// A uniformly distributed random value with the top bit cleared
/// (63 usable bits), suitable for collision-free file naming.
pub fn next_u63() -> u64 {
    let mut rng = source().lock().expect("random source poisoned");
    rng.next_u64() & !(1u64 << 63)
}

/// Fill `buf` with random bytes from the shared source.
pub fn fill(buf: &mut [u8]) {
    let mut rng = source().lock().expect("random source poisoned");
    rng.fill_bytes(buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn top_bit_is_always_clear() {
        for _ in 0..1000 {
            assert_eq!(next_u63() >> 63, 0);
        }
    }

    #[test]
    fn concurrent_values_are_distinct() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| (0..125).map(|_| next_u63()).collect::<Vec<u64>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for v in handle.join().expect("worker panicked") {
                assert!(seen.insert(v), "duplicate random value {}", v);
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn low_byte_is_roughly_uniform() {
        // 1000 samples over 256 buckets: a sane distribution keeps the
        // standard deviation of bucket counts well below 9.
        let mut buckets = [0u32; 256];
        for _ in 0..1000 {
            buckets[(next_u63() & 0xff) as usize] += 1;
        }
        let (mut sum, mut squaresum) = (0f64, 0f64);
        for count in buckets {
            sum += count as f64;
            squaresum += (count as f64) * (count as f64);
        }
        let mean = sum / 256.0;
        let sd = (squaresum / 256.0 - mean * mean).sqrt();
        assert!(sd < 9.0, "standard deviation {} too high", sd);
    }
}
