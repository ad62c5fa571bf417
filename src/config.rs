/*!
 * Run configuration
 *
 * Built once from the command line, validated, then shared by reference
 * with every component and worker thread.
 */

use std::time::Duration;

use crate::error::{DriverError, Result};
use crate::password_gen::{decode_password, CharsetMap};
use crate::protocol::{MAX_UNITS, MESSAGE_LEN};

/// Parallel units per device (two crackers per serial port)
pub const DEFAULT_UNITS: usize = 2;

/// Default target core clock in MHz
pub const DEFAULT_TARGET_MHZ: u32 = 100;

/// What to do when the capture does not yield a complete handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParsePolicy {
    /// Warn and program whatever was extracted
    #[default]
    Continue,
    /// Refuse to start
    Abort,
}

/// Response read discipline for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPolicy {
    /// Consecutive failed reads tolerated before giving up on a device
    pub max_retries: u32,
    /// Longest silence accepted while waiting for a frame (`None` waits forever)
    pub timeout: Option<Duration>,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    charset: CharsetMap,
    total_chars: usize,
    device_chars: usize,
    prefix: Vec<u8>,
    postfix: Vec<u8>,
    units: usize,
    target_mhz: u32,
    verbose: bool,
    verify_hits: bool,
    parse_policy: ParsePolicy,
    read_policy: ReadPolicy,
}

impl RunConfig {
    #[inline]
    pub fn charset(&self) -> &CharsetMap {
        &self.charset
    }

    /// Characters tested per candidate (excluding prefix and postfix)
    #[inline]
    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    /// Characters walked by the device counter; the last one is host assigned
    #[inline]
    pub fn device_chars(&self) -> usize {
        self.device_chars
    }

    #[inline]
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    #[inline]
    pub fn postfix(&self) -> &[u8] {
        &self.postfix
    }

    #[inline]
    pub fn units(&self) -> usize {
        self.units
    }

    pub fn target_mhz(&self) -> u32 {
        self.target_mhz
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn verify_hits(&self) -> bool {
        self.verify_hits
    }

    pub fn parse_policy(&self) -> ParsePolicy {
        self.parse_policy
    }

    pub fn read_policy(&self) -> ReadPolicy {
        self.read_policy
    }

    /// Full candidate for a hit: prefix + decoded characters + postfix
    pub fn plaintext(&self, unit_id: u64, match_code: u64) -> Vec<u8> {
        let mut out = self.prefix.clone();
        out.extend(decode_password(
            unit_id,
            match_code,
            self.charset.as_bytes(),
            self.total_chars,
            self.device_chars,
        ));
        out.extend_from_slice(&self.postfix);
        out
    }
}

/// Builder for [`RunConfig`]; `build` performs all validation
#[derive(Debug, Clone)]
pub struct RunConfigBuilder {
    charset_spec: String,
    total_chars: usize,
    prefix: String,
    postfix: String,
    units: usize,
    target_mhz: u32,
    verbose: bool,
    verify_hits: bool,
    parse_policy: ParsePolicy,
    read_policy: ReadPolicy,
}

impl RunConfigBuilder {
    pub fn new(charset_spec: &str, total_chars: usize) -> Self {
        Self {
            charset_spec: charset_spec.to_string(),
            total_chars,
            prefix: String::new(),
            postfix: String::new(),
            units: DEFAULT_UNITS,
            target_mhz: DEFAULT_TARGET_MHZ,
            verbose: false,
            verify_hits: false,
            parse_policy: ParsePolicy::default(),
            read_policy: ReadPolicy::default(),
        }
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn postfix(mut self, postfix: &str) -> Self {
        self.postfix = postfix.to_string();
        self
    }

    pub fn units(mut self, units: usize) -> Self {
        self.units = units;
        self
    }

    pub fn target_mhz(mut self, mhz: u32) -> Self {
        self.target_mhz = mhz;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn verify_hits(mut self, verify: bool) -> Self {
        self.verify_hits = verify;
        self
    }

    pub fn parse_policy(mut self, policy: ParsePolicy) -> Self {
        self.parse_policy = policy;
        self
    }

    pub fn read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    pub fn build(self) -> Result<RunConfig> {
        let charset = CharsetMap::expand(&self.charset_spec);
        if charset.is_empty() {
            return Err(DriverError::Configuration(
                "charset expands to nothing".to_string(),
            ));
        }
        // Map length is sent as a single payload byte
        if charset.len() > u8::MAX as usize {
            return Err(DriverError::Configuration(format!(
                "charset has {} characters, at most {} fit the map RAM",
                charset.len(),
                u8::MAX
            )));
        }
        if self.total_chars == 0 {
            return Err(DriverError::Configuration(
                "number of characters must be at least 1".to_string(),
            ));
        }

        let length = self.prefix.len() + self.total_chars + self.postfix.len();
        if length >= MESSAGE_LEN {
            return Err(DriverError::Configuration(format!(
                "password is too long: prefix + {} chars + postfix = {} (must be < {})",
                self.total_chars, length, MESSAGE_LEN
            )));
        }

        if self.units == 0 || self.units > MAX_UNITS {
            return Err(DriverError::Configuration(format!(
                "parallel units per device must be 1..={}, got {}",
                MAX_UNITS, self.units
            )));
        }
        if self.target_mhz == 0 {
            return Err(DriverError::Configuration(
                "target frequency must be positive".to_string(),
            ));
        }

        Ok(RunConfig {
            charset,
            total_chars: self.total_chars,
            device_chars: self.total_chars - 1,
            prefix: self.prefix.into_bytes(),
            postfix: self.postfix.into_bytes(),
            units: self.units,
            target_mhz: self.target_mhz,
            verbose: self.verbose,
            verify_hits: self.verify_hits,
            parse_policy: self.parse_policy,
            read_policy: self.read_policy,
        })
    }
}
