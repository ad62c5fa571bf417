/*!
 * Search space generation and partitioning
 *
 * The brute-force registers inside each device walk the low password
 * characters in a generalized reflected gray-code order, so every step
 * changes exactly one character. The remaining (high) characters are fixed
 * per parallel unit by the host: each unit is programmed with one charset
 * column, and columns are striped across devices.
 */

use std::fmt;

/// Ordered character map programmed into the devices.
///
/// Duplicates are allowed and kept; the map is built once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharsetMap {
    chars: Vec<u8>,
}

impl CharsetMap {
    /// Expand a charset specification such as `a-zA-Z0-9` or `ab\-c`
    pub fn expand(spec: &str) -> Self {
        Self {
            chars: expand_charset(spec),
        }
    }

    pub fn from_bytes(chars: &[u8]) -> Self {
        Self {
            chars: chars.to_vec(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    #[inline]
    pub fn get(&self, column: usize) -> Option<u8> {
        self.chars.get(column).copied()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.chars
    }
}

impl fmt::Display for CharsetMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.chars))
    }
}

/// Expand a charset specification, left to right.
///
/// `\-` is a literal dash, `X-Y` is the inclusive range `X..=Y`, anything
/// else passes through unchanged.
pub fn expand_charset(spec: &str) -> Vec<u8> {
    let bytes = spec.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if i + 1 < bytes.len() && bytes[i] == b'\\' && bytes[i + 1] == b'-' {
            out.push(b'-');
            i += 2;
        } else if i + 2 < bytes.len() && bytes[i + 1] == b'-' {
            out.extend(bytes[i]..=bytes[i + 2]);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    out
}

/// One parallel unit's assignment: which charset column it tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub device: usize,
    pub column: usize,
}

/// The `units` consecutive columns programmed into one device at once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub base: usize,
    pub items: Vec<WorkItem>,
}

/// Fixed stride assignment of charset columns to one device.
///
/// With `D` devices and `P` units per device, device `d` starts batches at
/// `d*P, d*P + D*P, ...` while the base stays below the charset size.
#[derive(Debug, Clone, Copy)]
pub struct StridePlan {
    device: usize,
    devices: usize,
    units: usize,
    charset_len: usize,
}

impl StridePlan {
    pub fn new(device: usize, devices: usize, units: usize, charset_len: usize) -> Self {
        Self {
            device,
            devices,
            units,
            charset_len,
        }
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.units * self.device
    }

    #[inline]
    pub fn step(&self) -> usize {
        self.units * self.devices
    }

    /// Batch base columns owned by this device
    pub fn bases(&self) -> impl Iterator<Item = usize> {
        let step = self.step().max(1);
        (self.start()..self.charset_len).step_by(step)
    }

    pub fn batches(&self) -> impl Iterator<Item = Batch> + '_ {
        self.bases().map(move |base| Batch {
            base,
            items: (0..self.units)
                .map(|unit| WorkItem {
                    device: self.device,
                    column: base + unit,
                })
                .collect(),
        })
    }

    pub fn batch_count(&self) -> usize {
        self.bases().count()
    }
}

/// Recover the tested password segment from a device match code.
///
/// The low `device_chars` characters come from `match_code` through the
/// generalized reflected gray code the device counter uses (least
/// significant first). The remaining `total_chars - device_chars` characters
/// come from `unit_id` (batch base + responding unit) as plain base-|charset|
/// digits, least significant first.
pub fn decode_password(
    unit_id: u64,
    match_code: u64,
    charset: &[u8],
    total_chars: usize,
    device_chars: usize,
) -> Vec<u8> {
    let base = charset.len() as u64;
    let mut out = Vec::with_capacity(total_chars);
    if base == 0 {
        return out;
    }

    let mut n = match_code;
    for _ in 0..device_chars {
        let c = (n % base) as usize;
        if (n / base) % 2 == 0 {
            out.push(charset[c]);
        } else {
            out.push(charset[charset.len() - 1 - c]);
        }
        n /= base;
    }

    let mut id = unit_id;
    for _ in 0..total_chars.saturating_sub(device_chars) {
        out.push(charset[(id % base) as usize]);
        id /= base;
    }

    out
}

/// Inverse of the gray segment of [`decode_password`].
///
/// Returns `None` if a character is not in the charset. With duplicate
/// characters the first occurrence is used.
pub fn gray_index(segment: &[u8], charset: &[u8]) -> Option<u64> {
    let base = charset.len() as u64;
    let mut n: u64 = 0;

    for &ch in segment.iter().rev() {
        let idx = charset.iter().position(|&c| c == ch)? as u64;
        let digit = if n % 2 == 0 { idx } else { base - 1 - idx };
        n = n * base + digit;
    }

    Some(n)
}

/// Total number of candidates for `chars` positions, saturating
pub fn combinations(charset_len: usize, chars: usize) -> u128 {
    (charset_len as u128)
        .checked_pow(chars as u32)
        .unwrap_or(u128::MAX)
}

/// Hash rate of one device at 100 MHz: one candidate every 8192 cycles
pub const DEVICE_HASHES_PER_SEC: f64 = 100e6 / 8192.0;

/// Rough duration of the whole search on a single device, in hours
pub fn estimated_hours(combinations: u128) -> f64 {
    combinations as f64 / DEVICE_HASHES_PER_SEC / 3600.0
}
