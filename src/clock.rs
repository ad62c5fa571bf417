/*!
 * PLL parameter search
 *
 * The core clock is `base * M / D`. The VCO must stay within 400..1000 MHz,
 * and both registers store their value minus one.
 */

use crate::error::{DriverError, Result};

/// Reference oscillator on the board, MHz
pub const BASE_CLOCK_MHZ: u32 = 25;

const VCO_MIN_MHZ: u32 = 400;
const VCO_MAX_MHZ: u32 = 1000;
/// Divider register is 8 bits wide (value minus one)
const MAX_DIVIDER: u32 = 256;

/// Register values for the PLL
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSettings {
    /// Multiplier register (M - 1)
    pub multiplier: u8,
    /// Divider register (D - 1)
    pub divider: u8,
    /// Resulting core frequency in MHz
    pub frequency_mhz: f64,
}

fn multiplier_range(base: u32) -> std::ops::Range<u32> {
    (VCO_MIN_MHZ / base + 1)..(VCO_MAX_MHZ / base)
}

/// Find the highest reachable frequency not above `target_mhz`
pub fn solve(base_mhz: u32, target_mhz: u32) -> Result<ClockSettings> {
    if base_mhz == 0 || target_mhz == 0 {
        return Err(DriverError::Configuration(
            "clock frequencies must be positive".to_string(),
        ));
    }

    let target = target_mhz as f64;
    let mut best: Option<(u32, u32, f64)> = None;

    for m in multiplier_range(base_mhz) {
        let vco = (base_mhz * m) as f64;
        // Start just below the ideal divider
        let mut d = (vco / target - 1.0).max(0.0) as u32;
        loop {
            d += 1;
            if d >= m * 20 || d > MAX_DIVIDER {
                break;
            }
            let freq = vco / d as f64;
            let better = best.map_or(true, |(_, _, f)| f < freq);
            if better && freq <= target {
                best = Some((m, d, freq));
            }
        }
    }

    let (m, d, freq) = best.ok_or_else(|| {
        DriverError::Configuration(format!(
            "no PLL setting reaches {} MHz or below from a {} MHz base",
            target_mhz, base_mhz
        ))
    })?;

    Ok(ClockSettings {
        multiplier: (m - 1) as u8,
        divider: (d - 1) as u8,
        frequency_mhz: freq,
    })
}

/// Every distinct frequency in `lo..=hi` the PLL can produce, ascending
pub fn achievable_frequencies(base_mhz: u32, lo: f64, hi: f64) -> Vec<f64> {
    if base_mhz == 0 {
        return Vec::new();
    }

    let mut freqs: Vec<f64> = Vec::new();
    for m in multiplier_range(base_mhz) {
        let vco = (base_mhz * m) as f64;
        for d in 1..(m * 30).min(MAX_DIVIDER + 1) {
            let f = vco / d as f64;
            if f >= lo && f <= hi {
                freqs.push(f);
            }
        }
    }

    freqs.sort_by(|a, b| a.total_cmp(b));
    freqs.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
    freqs
}
