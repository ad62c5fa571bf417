mod cli;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Args, Mode};
use wpa_fpga_driver::clock::{self, BASE_CLOCK_MHZ};
use wpa_fpga_driver::config::{ParsePolicy, ReadPolicy, RunConfigBuilder};
use wpa_fpga_driver::coordinator::{setup_program, Coordinator, HitVerifier};
use wpa_fpga_driver::crypto::{verify_password, CryptoMaterial};
use wpa_fpga_driver::device::open_devices;
use wpa_fpga_driver::handshake::{format_mac, parse_mac, read_capture, Extraction, HandshakeRecord};
use wpa_fpga_driver::password_gen::{combinations, estimated_hours};
use wpa_fpga_driver::report::Reporter;

/// Time for the PLL to lock after reprogramming
const CLOCK_SETTLE: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    match args.mode {
        Mode::Crack {
            charset,
            num_chars,
            bssid,
            capture,
            prefix,
            postfix,
            freq,
            test,
            devices,
            units,
            strict,
            verify_hits,
            read_timeout,
            read_retries,
        } => {
            let config = RunConfigBuilder::new(&charset, num_chars)
                .prefix(&prefix)
                .postfix(&postfix)
                .units(units)
                .target_mhz(freq)
                .verbose(args.verbose)
                .verify_hits(verify_hits)
                .parse_policy(if strict {
                    ParsePolicy::Abort
                } else {
                    ParsePolicy::Continue
                })
                .read_policy(ReadPolicy {
                    max_retries: read_retries,
                    timeout: read_timeout.map(Duration::from_secs),
                })
                .build()
                .context("Invalid run configuration")?;

            handle_crack_mode(&config, &bssid, &capture, test.as_deref(), &devices)?;
        }
        Mode::Inspect {
            bssid,
            capture,
            output,
        } => {
            handle_inspect_mode(&bssid, &capture, output.as_deref())?;
        }
        Mode::Verify {
            bssid,
            capture,
            password,
        } => {
            handle_verify_mode(&bssid, &capture, &password)?;
        }
        Mode::Clocks { base, min, max } => {
            handle_clocks_mode(base, min, max)?;
        }
    }

    Ok(())
}

fn load_extraction(bssid: &str, capture: &Path) -> Result<Extraction> {
    let target = parse_mac(bssid).context("Invalid BSSID")?;
    read_capture(capture, target)
        .with_context(|| format!("Failed to read capture {}", capture.display()))
}

fn report_missing(extraction: &Extraction) {
    println!(
        "{}",
        "Could not find a complete handshake for this BSSID in the capture".yellow()
    );
    for piece in extraction.missing() {
        println!("  missing: {}", piece.yellow());
    }
}

/// Handle crack mode - program the boards and walk the search space
fn handle_crack_mode(
    config: &wpa_fpga_driver::RunConfig,
    bssid: &str,
    capture: &Path,
    test: Option<&Path>,
    device_paths: &[String],
) -> Result<()> {
    let extraction = load_extraction(bssid, capture)?;
    if !extraction.is_complete() {
        report_missing(&extraction);
    }
    let record = extraction
        .for_run(config.parse_policy())
        .context("Refusing to program the boards (--strict)")?;
    record.display();

    let material = CryptoMaterial::from_record(&record)?;

    let combos = combinations(config.charset().len(), config.total_chars());
    println!(
        "\nCharset to test {} ({} characters)",
        config.charset().to_string().cyan(),
        config.charset().len()
    );
    println!(
        "Testing {} characters, this is {} combinations ({:.2} hours on 1 board)",
        config.total_chars(),
        combos.to_string().cyan(),
        estimated_hours(combos)
    );

    let clock = clock::solve(BASE_CLOCK_MHZ, config.target_mhz())?;
    let mut devices = open_devices(test, device_paths)?;
    println!("{} device(s) found!", devices.len().to_string().green());

    let cancel = Arc::new(AtomicBool::new(false));
    let c = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        c.store(true, Ordering::SeqCst);
    }) {
        warn!("Cannot install Ctrl-C handler: {}", e);
    }

    let reporter = Reporter::new(config.verbose());
    let mut coordinator = Coordinator::new(config, &reporter, cancel.clone());
    if config.verify_hits() {
        coordinator = coordinator.with_verifier(HitVerifier::new(&record.essid, material.clone()));
    }

    let settle = if test.is_some() {
        Duration::ZERO
    } else {
        CLOCK_SETTLE
    };
    let setup = setup_program(&record, &material, config);
    let mut dropped = coordinator.clock_devices(&mut devices, &clock, settle);
    dropped.extend(coordinator.prepare(&mut devices, &setup));
    for e in &dropped {
        println!("{}", format!("Board dropped during setup: {}", e).red());
    }
    if devices.is_empty() {
        bail!("no board accepted the setup programs");
    }
    println!(
        "{}",
        format!("Setup done on {} board(s), starting to bruteforce!", devices.len()).green()
    );

    let summaries = coordinator.run(&mut devices);

    if cancel.load(Ordering::SeqCst) {
        println!("\n{}", "Resetting boards and exiting!".yellow());
    }
    coordinator.reset_all(&mut devices);

    let hits = reporter.hits();
    println!();
    if hits.is_empty() {
        println!("{}", "✗ No password found".red());
    } else {
        for hit in &hits {
            println!(
                "{} {}",
                "✓ Password found:".bold().green(),
                hit.plaintext_lossy().bold().cyan()
            );
        }
    }

    let failed: Vec<_> = summaries.iter().filter(|s| s.error.is_some()).collect();
    for summary in &failed {
        if let Some(e) = &summary.error {
            println!("{}", format!("Device {} failed: {}", summary.device, e).red());
        }
    }
    if !summaries.is_empty() && failed.len() == summaries.len() {
        bail!("all {} device(s) failed", summaries.len());
    }

    Ok(())
}

/// Handle inspect mode - show (and optionally save) the extracted handshake
fn handle_inspect_mode(bssid: &str, capture: &Path, output: Option<&Path>) -> Result<()> {
    let extraction = load_extraction(bssid, capture)?;
    println!(
        "Scanned {} frame(s), completion mask {:#05b}\n",
        extraction.frames_seen, extraction.mask
    );

    if !extraction.is_complete() {
        report_missing(&extraction);
    }
    extraction.record.display();

    if let Some(path) = output {
        let record = extraction.complete()?;
        record
            .save_to_file(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!(
            "\n{}",
            format!("✓ Saved handshake to {}", path.display()).green()
        );
    }

    Ok(())
}

/// Handle verify mode - test one password in software
fn handle_verify_mode(bssid: &str, capture: &Path, password: &str) -> Result<()> {
    let is_json = capture
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

    let record = if is_json {
        let target = parse_mac(bssid).context("Invalid BSSID")?;
        let record = HandshakeRecord::load_from_file(capture)
            .with_context(|| format!("Failed to load {}", capture.display()))?;
        if record.bssid != target {
            bail!(
                "record is for {}, not {}",
                format_mac(&record.bssid),
                format_mac(&target)
            );
        }
        record
    } else {
        load_extraction(bssid, capture)?.complete()?
    };

    if verify_password(password.as_bytes(), &record) {
        println!(
            "{} {}",
            "✓ Password matches:".bold().green(),
            password.bold().cyan()
        );
        Ok(())
    } else {
        bail!("password does not match the handshake for '{}'", record.essid_lossy())
    }
}

/// Handle clocks mode - list reachable PLL frequencies
fn handle_clocks_mode(base: u32, min: f64, max: f64) -> Result<()> {
    if min > max {
        bail!("--min must not exceed --max");
    }

    let freqs = clock::achievable_frequencies(base, min, max);
    if freqs.is_empty() {
        println!("{}", "No reachable frequencies in range".yellow());
        return Ok(());
    }

    println!("{}", format!("Frequencies from a {} MHz base:", base).bold());
    for chunk in freqs.chunks(6) {
        let line: Vec<String> = chunk.iter().map(|f| format!("{:>9.3}", f)).collect();
        println!("{}", line.join(" "));
    }
    println!("\n{}", format!("✓ {} frequencies", freqs.len()).green());

    Ok(())
}
