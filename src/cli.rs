use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "wpa-fpga-driver")]
#[command(version)]
#[command(about = "Drive FPGA boards through a WPA/WPA2 passphrase search", long_about = None)]
pub struct Args {
    /// Verbose output (debug logging, per-unit starting messages)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand)]
pub enum Mode {
    /// Brute-force a captured handshake on one or more boards
    ///
    /// The charset accepts ranges (a-z) and an escaped dash (\-).
    /// NUM_CHARS counts only the searched characters, not --pre/--post.
    ///
    /// Example: wpa-fpga-driver crack 0-9 8 00:11:22:33:44:55 dump.cap --dev /dev/ttyUSB0
    Crack {
        /// Characters to search
        #[arg(value_name = "CHARSET")]
        charset: String,

        /// Number of searched characters
        #[arg(value_name = "NUM_CHARS")]
        num_chars: usize,

        /// Target access point MAC (any separators)
        #[arg(value_name = "BSSID")]
        bssid: String,

        /// Capture file (pcap or pcapng)
        #[arg(value_name = "CAPTURE")]
        capture: PathBuf,

        /// Fixed text before the searched characters
        #[arg(long = "pre", default_value = "")]
        prefix: String,

        /// Fixed text after the searched characters
        #[arg(long = "post", default_value = "")]
        postfix: String,

        /// Target core clock in MHz
        #[arg(short = 'f', long = "freq", default_value = "100")]
        freq: u32,

        /// Write the command stream to a file instead of a board
        #[arg(long = "test", value_name = "FILE")]
        test: Option<PathBuf>,

        /// Serial port of a board (repeat for several boards)
        #[arg(long = "dev", value_name = "PATH")]
        devices: Vec<String>,

        /// Parallel cracking units per board
        #[arg(long, default_value = "2")]
        units: usize,

        /// Refuse to start when the handshake is incomplete
        #[arg(long)]
        strict: bool,

        /// Re-check every reported password in software
        #[arg(long = "verify-hits")]
        verify_hits: bool,

        /// Give up on a silent board after this many seconds
        #[arg(long = "read-timeout", value_name = "SECS")]
        read_timeout: Option<u64>,

        /// Consecutive read errors tolerated per board
        #[arg(long = "read-retries", default_value = "8")]
        read_retries: u32,
    },

    /// Extract and display the handshake for a BSSID
    ///
    /// Example: wpa-fpga-driver inspect 00:11:22:33:44:55 dump.cap --output hs.json
    Inspect {
        /// Target access point MAC
        #[arg(value_name = "BSSID")]
        bssid: String,

        /// Capture file (pcap or pcapng)
        #[arg(value_name = "CAPTURE")]
        capture: PathBuf,

        /// Save the extracted record as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a single password against a captured handshake in software
    ///
    /// Example: wpa-fpga-driver verify 00:11:22:33:44:55 dump.cap hunter22
    Verify {
        /// Target access point MAC
        #[arg(value_name = "BSSID")]
        bssid: String,

        /// Capture file, or a JSON record saved by `inspect`
        #[arg(value_name = "CAPTURE")]
        capture: PathBuf,

        /// Password to test
        #[arg(value_name = "PASSWORD")]
        password: String,
    },

    /// List the core clock frequencies the PLL can produce
    Clocks {
        /// Reference oscillator in MHz
        #[arg(long, default_value = "25")]
        base: u32,

        /// Lowest frequency to list
        #[arg(long, default_value = "50")]
        min: f64,

        /// Highest frequency to list
        #[arg(long, default_value = "250")]
        max: f64,
    },
}
