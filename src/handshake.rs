/*!
 * WPA/WPA2 handshake extraction
 *
 * Scans raw 802.11 frames for the three pieces the devices need:
 * - the SSID of the target BSSID (beacon / probe response)
 * - the AP nonce (message 1)
 * - the client nonce, MIC and EAPOL body (message 2, sent to the target BSSID)
 *
 * Frames are dissected at fixed offsets; anything too short is skipped.
 */

use std::fs::File;
use std::path::Path;

use colored::Colorize;
use pcap_parser::{Block, PcapBlockOwned, PcapError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ParsePolicy;
use crate::error::{DriverError, Result};

/// AP nonce found
pub const MASK_ANONCE: u8 = 0b001;
/// Client nonce, MIC and EAPOL body found
pub const MASK_CLIENT: u8 = 0b010;
/// SSID found
pub const MASK_SSID: u8 = 0b100;
pub const MASK_COMPLETE: u8 = MASK_ANONCE | MASK_CLIENT | MASK_SSID;

/// Longest EAPOL body kept
pub const MAX_EAPOL_LEN: usize = 256;
/// Offset of the MIC inside the EAPOL key frame
pub const MIC_OFFSET: usize = 81;
pub const MIC_LEN: usize = 16;
/// Offset of the key nonce inside the EAPOL key frame
const NONCE_OFFSET: usize = 17;

const FC_PROBE_RESPONSE: u8 = 0x50;
const FC_BEACON: u8 = 0x80;
const FC_QOS_DATA: u8 = 0x88;

const MGMT_MIN_CAPLEN: usize = 26 + 14;
const DATA_MIN_CAPLEN: usize = 26 + 8 + 9;
/// Timestamp, beacon interval and capabilities precede the first element
const MGMT_FIXED_PARAMS: usize = 12;
const SSID_MAX_LEN: usize = 32;

const EAPOL_ETHERTYPE: [u8; 2] = [0x88, 0x8E];
const EAPOL_KEY_PACKET: u8 = 0x03;
const DESCRIPTOR_RSN: u8 = 0x02;
const DESCRIPTOR_WPA: u8 = 0xFE;
/// Key descriptor version 2: HMAC-SHA1 MIC
const KEY_VERSION_HMAC_SHA1: u8 = 0x02;

const LINKTYPE_IEEE802_11: i32 = 105;
const LINKTYPE_IEEE802_11_RADIOTAP: i32 = 127;

/// Everything the devices need from a captured 4-way handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRecord {
    /// AP MAC address
    pub bssid: [u8; 6],

    /// Client MAC address
    pub client_mac: [u8; 6],

    /// Authenticator nonce (message 1)
    pub anonce: [u8; 32],

    /// Supplicant nonce (message 2)
    pub snonce: [u8; 32],

    /// Message 2 EAPOL body with the MIC field zeroed
    pub eapol: Vec<u8>,

    /// MIC as captured in message 2
    pub mic: [u8; 16],

    /// Network name
    pub essid: Vec<u8>,
}

impl HandshakeRecord {
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let record: HandshakeRecord = serde_json::from_str(&json)?;
        if record.eapol.len() > MAX_EAPOL_LEN {
            return Err(DriverError::Capture(format!(
                "EAPOL body of {} bytes exceeds {}",
                record.eapol.len(),
                MAX_EAPOL_LEN
            )));
        }
        Ok(record)
    }

    pub fn essid_lossy(&self) -> String {
        String::from_utf8_lossy(&self.essid).into_owned()
    }

    /// Print the record for the operator
    pub fn display(&self) {
        println!("{}", "WPA/WPA2 Handshake:".bold());
        println!("  SSID:       {}", self.essid_lossy().cyan());
        println!("  BSSID:      {}", format_mac(&self.bssid));
        println!("  Client MAC: {}", format_mac(&self.client_mac));
        println!("  ANonce:     {}", hex_string(&self.anonce).dimmed());
        println!("  SNonce:     {}", hex_string(&self.snonce).dimmed());
        println!("  MIC:        {}", hex_string(&self.mic).yellow());
        println!("  EAPOL:      {} bytes", self.eapol.len());
    }
}

/// Lowercase hex, no separators
pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Parse a MAC address, ignoring any separators (`00:11:22...`, `0011.22...`)
pub fn parse_mac(input: &str) -> Result<[u8; 6]> {
    let digits: Vec<u8> = input
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase() as u8)
        .collect();

    if digits.len() != 12 {
        return Err(DriverError::Configuration(format!(
            "'{}' is not a MAC address (need 12 hex digits)",
            input
        )));
    }

    let mut mac = [0u8; 6];
    for (i, pair) in digits.chunks(2).enumerate() {
        let text = std::str::from_utf8(pair).unwrap_or("00");
        mac[i] = u8::from_str_radix(text, 16)
            .map_err(|e| DriverError::Configuration(format!("bad MAC '{}': {}", input, e)))?;
    }
    Ok(mac)
}

/// Key message classification from the key information flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMessage {
    /// MIC=0 Ack=1 Install=0 Pairwise=1
    One,
    /// MIC=1 Ack=0 Install=1 Pairwise=1 (Install tested set)
    Two,
    Unclassified,
}

/// Classify from key information bytes (`hi` = byte 5, `lo` = byte 6)
pub fn classify_key_info(hi: u8, lo: u8) -> KeyMessage {
    let mic = hi & 0x01 != 0;
    let ack = lo & 0x80 != 0;
    let install = lo & 0x40 != 0;
    let pairwise = lo & 0x08 != 0;

    match (mic, ack, install, pairwise) {
        (false, true, false, true) => KeyMessage::One,
        (true, false, true, true) => KeyMessage::Two,
        _ => KeyMessage::Unclassified,
    }
}

/// Header length of an 802.11 frame; both DS bits set adds a fourth address
#[inline]
fn header_len(frame: &[u8], three_addr: usize) -> usize {
    if frame[1] & 0x03 == 0x03 {
        three_addr + 6
    } else {
        three_addr
    }
}

/// Outcome of a capture scan
#[derive(Debug, Clone)]
pub struct Extraction {
    pub record: HandshakeRecord,
    pub mask: u8,
    pub frames_seen: u64,
}

impl Extraction {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.mask == MASK_COMPLETE
    }

    /// The record, or `ParseIncomplete` when a piece is missing
    pub fn complete(self) -> Result<HandshakeRecord> {
        if self.is_complete() {
            Ok(self.record)
        } else {
            Err(DriverError::ParseIncomplete { mask: self.mask })
        }
    }

    /// The record to program the boards with under `policy`.
    ///
    /// `Continue` hands back whatever was found; `Abort` only a complete record.
    pub fn for_run(self, policy: ParsePolicy) -> Result<HandshakeRecord> {
        match policy {
            ParsePolicy::Abort => self.complete(),
            ParsePolicy::Continue => {
                if !self.is_complete() {
                    warn!(
                        "Continuing with an incomplete handshake (mask {:#05b})",
                        self.mask
                    );
                }
                Ok(self.record)
            }
        }
    }

    /// Names of the missing pieces, for diagnostics
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.mask & MASK_ANONCE == 0 {
            missing.push("AP nonce (message 1)");
        }
        if self.mask & MASK_CLIENT == 0 {
            missing.push("client nonce/MIC (message 2)");
        }
        if self.mask & MASK_SSID == 0 {
            missing.push("SSID (beacon/probe response)");
        }
        missing
    }
}

/// Incremental handshake extractor for one target BSSID
pub struct HandshakeExtractor {
    target: [u8; 6],
    record: HandshakeRecord,
    mask: u8,
    frames_seen: u64,
}

impl HandshakeExtractor {
    pub fn new(target: [u8; 6]) -> Self {
        Self {
            target,
            record: HandshakeRecord::default(),
            mask: 0,
            frames_seen: 0,
        }
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        self.mask
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.mask == MASK_COMPLETE
    }

    /// Feed one frame starting at the frame-control byte.
    ///
    /// Returns true once the handshake is complete; later frames are ignored.
    pub fn feed(&mut self, frame: &[u8]) -> bool {
        if self.is_complete() {
            return true;
        }
        self.frames_seen += 1;

        if frame.len() < 2 {
            return false;
        }

        match frame[0] {
            FC_PROBE_RESPONSE | FC_BEACON if frame.len() >= MGMT_MIN_CAPLEN => {
                self.management_frame(frame)
            }
            FC_QOS_DATA if frame.len() >= DATA_MIN_CAPLEN => {
                if let Err(e) = self.data_frame(frame) {
                    warn!("Skipping key frame: {}", e);
                }
            }
            _ => {}
        }

        if self.is_complete() {
            self.log_summary();
        }
        self.is_complete()
    }

    pub fn finish(self) -> Extraction {
        Extraction {
            record: self.record,
            mask: self.mask,
            frames_seen: self.frames_seen,
        }
    }

    fn management_frame(&mut self, frame: &[u8]) {
        let params = header_len(frame, 24) + MGMT_FIXED_PARAMS;
        let (Some(&tag), Some(&len)) = (frame.get(params), frame.get(params + 1)) else {
            return;
        };
        if tag != 0 || frame[10..16] != self.target {
            return;
        }

        let start = params + 2;
        let end = (start + (len as usize).min(SSID_MAX_LEN)).min(frame.len());
        self.record.essid = frame[start..end].to_vec();
        self.mask |= MASK_SSID;
        debug!("SSID '{}' from {}", self.record.essid_lossy(), format_mac(&self.target));
    }

    fn data_frame(&mut self, frame: &[u8]) -> Result<()> {
        let llc = header_len(frame, 26);
        let Some(llc_header) = frame.get(llc..llc + 8) else {
            return Ok(());
        };
        if llc_header[6..8] != EAPOL_ETHERTYPE {
            return Ok(());
        }

        let key = &frame[llc + 8..];
        if key.len() < 7 {
            return Ok(());
        }

        let packet_type = key[1];
        let descriptor = key[4];
        let key_version = key[6] & 0x07;
        if packet_type != EAPOL_KEY_PACKET
            || key_version != KEY_VERSION_HMAC_SHA1
            || (descriptor != DESCRIPTOR_RSN && descriptor != DESCRIPTOR_WPA)
        {
            return Err(DriverError::UnsupportedCipher {
                packet_type,
                key_version,
                descriptor,
            });
        }

        match classify_key_info(key[5], key[6]) {
            KeyMessage::One => {
                if let Some(nonce) = key.get(NONCE_OFFSET..NONCE_OFFSET + 32) {
                    self.record.anonce.copy_from_slice(nonce);
                    self.mask |= MASK_ANONCE;
                    debug!("AP nonce {}", hex_string(nonce));
                }
            }
            // Anything else sent to the target AP is taken as the client frame
            KeyMessage::Two | KeyMessage::Unclassified => {
                if frame[4..10] == self.target {
                    self.client_frame(frame, key);
                }
            }
        }

        Ok(())
    }

    fn client_frame(&mut self, frame: &[u8], key: &[u8]) {
        if key.len() < MIC_OFFSET + MIC_LEN {
            debug!("Key frame of {} bytes has no MIC, skipped", key.len());
            return;
        }

        let nonce = &key[NONCE_OFFSET..NONCE_OFFSET + 32];
        if nonce.iter().all(|&b| b == 0) {
            // Message 4 carries no nonce
            return;
        }

        let body_len = u16::from_be_bytes([key[2], key[3]]) as usize + 4;
        let eapol_len = body_len.min(MAX_EAPOL_LEN).min(key.len());
        if eapol_len < body_len {
            debug!("EAPOL body truncated from {} to {} bytes", body_len, eapol_len);
        }

        self.record.bssid.copy_from_slice(&frame[4..10]);
        self.record.client_mac.copy_from_slice(&frame[10..16]);
        self.record.snonce.copy_from_slice(nonce);

        let mut eapol = key[..eapol_len].to_vec();
        for b in eapol.iter_mut().skip(MIC_OFFSET).take(MIC_LEN) {
            *b = 0;
        }
        self.record.eapol = eapol;
        self.record
            .mic
            .copy_from_slice(&key[MIC_OFFSET..MIC_OFFSET + MIC_LEN]);

        self.mask |= MASK_CLIENT;
        debug!(
            "Client frame from {} ({} byte EAPOL)",
            format_mac(&self.record.client_mac),
            eapol_len
        );
    }

    fn log_summary(&self) {
        let r = &self.record;
        info!(
            "Got handshake for BSSID {} and client {}",
            hex_string(&r.bssid),
            hex_string(&r.client_mac)
        );
        info!("SNonce is {}", hex_string(&r.snonce));
        info!("ANonce is {}", hex_string(&r.anonce));
        info!("MIC is {}", hex_string(&r.mic));
        info!("EAPOL is {}", hex_string(&r.eapol));
    }
}

/// Run the extractor over in-memory frames
pub fn extract_from_frames<'a, I>(target: [u8; 6], frames: I) -> Extraction
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut extractor = HandshakeExtractor::new(target);
    for frame in frames {
        if extractor.feed(frame) {
            break;
        }
    }
    extractor.finish()
}

/// Strip the link-layer encapsulation so the frame starts at frame control
fn ieee80211_payload(linktype: i32, data: &[u8]) -> Option<&[u8]> {
    match linktype {
        LINKTYPE_IEEE802_11 => Some(data),
        LINKTYPE_IEEE802_11_RADIOTAP => {
            if data.len() < 4 {
                return None;
            }
            let radiotap_len = u16::from_le_bytes([data[2], data[3]]) as usize;
            data.get(radiotap_len..)
        }
        _ => None,
    }
}

fn feed_packet(extractor: &mut HandshakeExtractor, linktype: i32, data: &[u8]) -> bool {
    match ieee80211_payload(linktype, data) {
        Some(frame) => extractor.feed(frame),
        None => false,
    }
}

/// Scan a pcap / pcapng capture file for the handshake of `target`
pub fn read_capture(path: &Path, target: [u8; 6]) -> Result<Extraction> {
    let file = File::open(path)?;
    let mut reader = pcap_parser::create_reader(65536, file)
        .map_err(|e| DriverError::Capture(format!("{}: {:?}", path.display(), e)))?;

    let mut extractor = HandshakeExtractor::new(target);
    let mut legacy_linktype = LINKTYPE_IEEE802_11;
    let mut interfaces: Vec<i32> = Vec::new();
    let mut stalled = false;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let done = match block {
                    PcapBlockOwned::LegacyHeader(header) => {
                        legacy_linktype = header.network.0;
                        if legacy_linktype != LINKTYPE_IEEE802_11
                            && legacy_linktype != LINKTYPE_IEEE802_11_RADIOTAP
                        {
                            warn!("Capture link type {} is not 802.11", legacy_linktype);
                        }
                        false
                    }
                    PcapBlockOwned::Legacy(packet) => {
                        let len = (packet.caplen as usize).min(packet.data.len());
                        feed_packet(&mut extractor, legacy_linktype, &packet.data[..len])
                    }
                    PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                        interfaces.clear();
                        false
                    }
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        interfaces.push(idb.linktype.0);
                        false
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        let linktype = interfaces
                            .get(epb.if_id as usize)
                            .copied()
                            .unwrap_or(LINKTYPE_IEEE802_11);
                        let len = (epb.caplen as usize).min(epb.data.len());
                        feed_packet(&mut extractor, linktype, &epb.data[..len])
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        let linktype = interfaces.first().copied().unwrap_or(LINKTYPE_IEEE802_11);
                        feed_packet(&mut extractor, linktype, spb.data)
                    }
                    PcapBlockOwned::NG(_) => false,
                };
                reader.consume(offset);
                stalled = false;
                if done {
                    break;
                }
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                if stalled {
                    warn!("Capture {} ends with a truncated packet", path.display());
                    break;
                }
                stalled = true;
                reader
                    .refill()
                    .map_err(|e| DriverError::Capture(format!("{:?}", e)))?;
            }
            Err(e) => {
                warn!("Stopped reading {}: {:?}", path.display(), e);
                break;
            }
        }
    }

    Ok(extractor.finish())
}
