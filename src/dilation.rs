//! Time-dilation calibration.
//!
//! Test timeouts are authored against a reference machine. On slower hosts
//! (laptops on battery, loaded CI runners, nested virtualization) those
//! budgets cause spurious timeouts, so every timeout and in-test sleep is
//! scaled by a process-wide dilation factor.
//!
//! The factor is derived once per process from a fixed CPU benchmark:
//! `elapsed / reference`, clamped to `[1.0, 10.0]`. Setting
//! `ORCA_TIMEOUT_FACTOR=<float>` skips the benchmark entirely.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Environment variable overriding the benchmark-derived factor.
pub const TIMEOUT_FACTOR_ENV: &str = "ORCA_TIMEOUT_FACTOR";

/// Environment variable exported to tests so in-script sleeps can scale.
pub const TIME_DILATION_ENV: &str = "TIME_DILATION";

/// Wall time the benchmark takes on the reference machine.
const REFERENCE_DURATION: Duration = Duration::from_millis(250);

/// Benchmark iteration count, tuned so [`REFERENCE_DURATION`] holds on the
/// reference machine. Changing this invalidates the reference.
const BENCH_ITERATIONS: u64 = 40_000_000;

const FACTOR_MIN: f64 = 1.0;
const FACTOR_MAX: f64 = 10.0;

/// The process-wide dilation factor.
///
/// First call runs the benchmark (or reads the env override); later calls
/// return the cached value.
pub fn factor() -> f64 {
    static FACTOR: OnceLock<f64> = OnceLock::new();
    *FACTOR.get_or_init(|| {
        if let Ok(raw) = std::env::var(TIMEOUT_FACTOR_ENV) {
            match raw.parse::<f64>() {
                Ok(f) if f.is_finite() && f > 0.0 => {
                    let clamped = f.clamp(FACTOR_MIN, FACTOR_MAX);
                    log::info!("[dilation] Using {TIMEOUT_FACTOR_ENV}={clamped}");
                    return clamped;
                }
                _ => {
                    log::warn!("[dilation] Ignoring unparseable {TIMEOUT_FACTOR_ENV}={raw:?}");
                }
            }
        }
        let measured = benchmark();
        log::info!("[dilation] Calibrated factor {measured:.2}");
        measured
    })
}

/// Scale a duration by the dilation factor.
#[must_use]
pub fn scale(d: Duration) -> Duration {
    d.mul_f64(factor())
}

/// Scale a whole-second timeout, rounding up so scaling never shortens it.
#[must_use]
pub fn scale_seconds(seconds: u64) -> u64 {
    if seconds == 0 {
        return 0;
    }
    let scaled = (seconds as f64 * factor()).ceil();
    scaled as u64
}

/// Run the fixed CPU benchmark and derive the clamped factor.
fn benchmark() -> f64 {
    let start = Instant::now();
    let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
    for i in 0..BENCH_ITERATIONS {
        // FNV-style mix; cheap enough to be CPU-bound, opaque enough that
        // the optimizer cannot fold the loop away.
        acc ^= i;
        acc = acc.wrapping_mul(0x0100_0000_01b3);
    }
    std::hint::black_box(acc);
    let elapsed = start.elapsed();
    (elapsed.as_secs_f64() / REFERENCE_DURATION.as_secs_f64()).clamp(FACTOR_MIN, FACTOR_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factor_is_clamped() {
        let f = factor();
        assert!((FACTOR_MIN..=FACTOR_MAX).contains(&f), "factor {f} out of range");
    }

    #[test]
    fn test_scale_seconds_zero_stays_zero() {
        // 0 means "no deadline" and must never become a real deadline.
        assert_eq!(scale_seconds(0), 0);
    }

    #[test]
    fn test_scale_never_shortens() {
        assert!(scale_seconds(30) >= 30);
        assert!(scale(Duration::from_secs(5)) >= Duration::from_secs(5));
    }
}
