//! Operator output.
//!
//! Worker threads report through one [`Reporter`]; each event is written as
//! a single locked write so lines from different devices never interleave.

use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Local};
use colored::Colorize;

use crate::handshake::hex_string;

/// A password reported by a device
#[derive(Debug, Clone)]
pub struct Hit {
    pub device: usize,
    pub unit: u8,
    pub unit_id: u64,
    pub match_code: u32,
    pub plaintext: Vec<u8>,
    /// Software check result, when enabled
    pub verified: Option<bool>,
    pub at: DateTime<Local>,
}

impl Hit {
    pub fn plaintext_lossy(&self) -> String {
        String::from_utf8_lossy(&self.plaintext).into_owned()
    }
}

pub struct Reporter {
    writer: Mutex<Box<dyn Write + Send>>,
    hits: Mutex<Vec<Hit>>,
    verbose: bool,
}

fn timestamp() -> String {
    Local::now().format("[%Y-%m-%d %H:%M:%S] ").to_string()
}

impl Reporter {
    /// Report to stderr
    pub fn new(verbose: bool) -> Self {
        Self::with_writer(Box::new(io::stderr()), verbose)
    }

    pub fn with_writer(writer: Box<dyn Write + Send>, verbose: bool) -> Self {
        Self {
            writer: Mutex::new(writer),
            hits: Mutex::new(Vec::new()),
            verbose,
        }
    }

    fn emit(&self, line: String) {
        let mut w = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        // Nowhere left to report a failed console write
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }

    pub fn device_started(
        &self,
        device: usize,
        describe: &str,
        start: usize,
        step: usize,
        columns: usize,
    ) {
        self.emit(format!(
            "Started device thread {} on {} ({}, {}, {})",
            device, describe, start, step, columns
        ));
    }

    pub fn initial_message(&self, device: usize, unit: usize, message: &[u8]) {
        if !self.verbose {
            return;
        }
        self.emit(
            format!(
                "  dev {} unit {} message {}",
                device,
                unit,
                hex_string(message)
            )
            .dimmed()
            .to_string(),
        );
    }

    pub fn hit(&self, hit: Hit) {
        let verified = match hit.verified {
            Some(true) => " (verified)".green().to_string(),
            Some(false) => " (software check FAILED)".red().to_string(),
            None => String::new(),
        };
        self.emit(format!(
            "{}{} {} ({}) [dev {} unit {}]{}",
            timestamp(),
            "Got a password match".green().bold(),
            hit.plaintext_lossy().yellow().bold(),
            hit.match_code,
            hit.device,
            hit.unit,
            verified
        ));
        self.hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hit);
    }

    pub fn batch_finished(&self, device: usize, unit: u8, payload: u32) {
        self.emit(format!(
            "{}Batch finished! ({}, {}) {}",
            timestamp(),
            device,
            unit,
            payload
        ));
    }

    pub fn malformed(&self, device: usize, frame: &[u8; 5]) {
        self.emit(format!(
            "{}{} dev {}: {}",
            timestamp(),
            "Malformed response!".red(),
            device,
            hex_string(frame)
        ));
    }

    pub fn device_failed(&self, device: usize, error: &dyn std::fmt::Display) {
        self.emit(format!(
            "{}{} {}: {}",
            timestamp(),
            "Device".red(),
            device,
            error
        ));
    }

    pub fn device_done(&self, device: usize, batches: usize) {
        self.emit(format!(
            "{}Device {} done after {} batch(es)",
            timestamp(),
            device,
            batches
        ));
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
