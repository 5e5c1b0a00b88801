//! Sample rate selection.
//!
//! The digital channel only runs at sample rates of the form `2^i * 5^j`, so a
//! requested protocol bit rate is mapped onto the closest achievable sample rate
//! for a fixed number of samples per protocol bit.

/// Hardware ceiling of the digital channel in samples per second.
pub const MAX_SAMPLE_RATE: u32 = 100_000_000;

/// Find the achievable sample rate closest to `target_rate * samples_per_cycle`.
///
/// Candidates are `2^i * 5^j` with `i` in `1..=8` and `j` in `0..=8`. On equal
/// distance the first candidate found (lowest `i`, then lowest `j`) wins.
pub fn resolve_sample_rate(target_rate: u32, samples_per_cycle: u32) -> u32 {
    if target_rate >= MAX_SAMPLE_RATE {
        return MAX_SAMPLE_RATE;
    }

    let need = u64::from(target_rate) * u64::from(samples_per_cycle);
    let mut best_distance = u64::from(MAX_SAMPLE_RATE);
    let mut best = u64::from(MAX_SAMPLE_RATE);

    let mut pow2 = 1u64;
    for _ in 1..=8 {
        pow2 *= 2;
        let mut pow5 = 1u64;
        for _ in 0..=8 {
            let divisor = pow2 * pow5;
            let distance = divisor.abs_diff(need);
            if distance < best_distance {
                best_distance = distance;
                best = divisor;
            }
            pow5 *= 5;
        }
    }

    // largest candidate is 2^8 * 5^8 == MAX_SAMPLE_RATE
    best as u32
}

/// Resolved timing of a protocol descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Sample rate programmed on the digital channel.
    pub sample_rate: u32,
    /// Bit rate actually produced at `sample_rate`.
    pub bit_rate: u32,
    pub samples_per_bit: u32,
}

impl Timing {
    pub fn resolve(target_rate: u32, samples_per_cycle: u32) -> Self {
        let sample_rate = resolve_sample_rate(target_rate, samples_per_cycle);
        let bit_rate = (sample_rate / samples_per_cycle).max(1);
        Self {
            sample_rate,
            bit_rate,
            samples_per_bit: sample_rate / bit_rate,
        }
    }

    pub fn samples_per_bit(&self) -> usize {
        self.samples_per_bit as usize
    }

    pub fn samples_per_half_bit(&self) -> usize {
        self.samples_per_bit() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force(target_rate: u32, samples_per_cycle: u32) -> u64 {
        let need = u64::from(target_rate) * u64::from(samples_per_cycle);
        let mut candidates = Vec::new();
        for i in 1..=8u32 {
            for j in 0..=8u32 {
                candidates.push((2u64.pow(i) * 5u64.pow(j), i, j));
            }
        }
        candidates
            .into_iter()
            .min_by_key(|&(divisor, i, j)| (divisor.abs_diff(need), i, j))
            .map(|(divisor, _, _)| divisor)
            .unwrap()
    }

    #[test]
    fn test_ceiling() {
        assert_eq!(resolve_sample_rate(MAX_SAMPLE_RATE, 4), MAX_SAMPLE_RATE);
        assert_eq!(resolve_sample_rate(u32::MAX, 8), MAX_SAMPLE_RATE);
    }

    #[test]
    fn test_common_rates() {
        // 100 kHz I2C lands exactly on 2^7 * 5^5
        assert_eq!(resolve_sample_rate(100_000, 4), 400_000);
        assert_eq!(resolve_sample_rate(1_000_000, 4), 4_000_000);
        // 115200 baud UART has no exact candidate
        assert_eq!(resolve_sample_rate(115_200, 8), 1_000_000);
        assert_eq!(resolve_sample_rate(9_600, 8), 80_000);
    }

    #[test]
    fn test_matches_brute_force() {
        let targets = [
            0, 1, 3, 7, 100, 1_234, 9_600, 19_200, 57_600, 100_000, 400_000, 1_000_000,
            3_333_333, 12_500_000, 24_999_999, 99_999_999,
        ];
        for &target in &targets {
            for &spc in &[4u32, 8] {
                let resolved = resolve_sample_rate(target, spc);
                assert_eq!(
                    u64::from(resolved),
                    brute_force(target, spc),
                    "target {} spc {}",
                    target,
                    spc
                );
            }
        }
    }

    #[test]
    fn test_tie_prefers_lower_power_of_two() {
        // need = 6: candidates 4 (2^2) and 8 (2^3) are both 2 away, 4 is found first
        assert_eq!(resolve_sample_rate(3, 2), 4);
    }

    #[test]
    fn test_timing_resolve() {
        let timing = Timing::resolve(100_000, 4);
        assert_eq!(timing.sample_rate, 400_000);
        assert_eq!(timing.bit_rate, 100_000);
        assert_eq!(timing.samples_per_bit(), 4);
        assert_eq!(timing.samples_per_half_bit(), 2);

        let uart = Timing::resolve(115_200, 8);
        assert_eq!(uart.bit_rate, 125_000);
        assert_eq!(uart.samples_per_bit(), 8);
    }
}
