/*!
 * WPA/WPA2 cryptographic material
 *
 * Two sides of the same computation:
 * - the buffers the devices hash (PKE block, padded EAPOL, microcode)
 * - a software verifier used to double check device hits
 *
 * References:
 * - IEEE 802.11i-2004 standard
 * - RFC 2898 (PBKDF2)
 * - FIPS 180-4 (SHA1 message padding)
 */

use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2;
use sha1::Sha1;

use crate::error::{DriverError, Result};
use crate::handshake::{HandshakeRecord, MAX_EAPOL_LEN};
use crate::protocol::{Opcode, Program};

type HmacSha1 = Hmac<Sha1>;

/// Constant for PRF expansion
const PRF_LABEL: &[u8] = b"Pairwise key expansion";

/// PKE block: label, NUL, ordered MACs and nonces, counter, SHA1 padding
pub const PKE_LEN: usize = 128;
/// Offset of the PRF counter byte in the PKE block
pub const PKE_COUNTER: usize = 99;
/// Padded EAPOL area: six SHA1 blocks
pub const EAPOL_BUF_LEN: usize = 384;
/// Device data RAM: PKE followed by EAPOL
pub const RAM_LEN: usize = PKE_LEN + EAPOL_BUF_LEN;
pub const MICROCODE_LEN: usize = 16;

const SHA1_BLOCK: usize = 64;

// Microcode fields
const UC_SEL_CNT: u8 = 0x00;
const UC_SEL_OUT: u8 = 0x80;
const UC_NO_WB: u8 = 0x00;
const UC_WB_80: u8 = 0x40;
const UC_WB_00: u8 = 0x60;
const UC_SEL_SCRATCH_ZERO: u8 = 0x08;
const UC_SEL_SCRATCH_PAD: u8 = 0x08 | 0x04;
const UC_XOR_36: u8 = 0x02;
const UC_XOR_5C: u8 = 0x03;
const UC_NOHASH: u8 = 0x10;

#[inline]
const fn uc_sel_reg(reg: usize) -> u8 {
    (reg & 0x7) as u8
}

/// Build the PKE block.
///
/// The result does not depend on which side is the AP: MACs and nonces are
/// ordered lexicographically, smaller first.
pub fn build_pke(record: &HandshakeRecord) -> [u8; PKE_LEN] {
    let mut pke = [0u8; PKE_LEN];
    pke[..PRF_LABEL.len()].copy_from_slice(PRF_LABEL);

    let (mac_lo, mac_hi) = if record.client_mac < record.bssid {
        (&record.client_mac, &record.bssid)
    } else {
        (&record.bssid, &record.client_mac)
    };
    pke[23..29].copy_from_slice(mac_lo);
    pke[29..35].copy_from_slice(mac_hi);

    let (nonce_lo, nonce_hi) = if record.snonce < record.anonce {
        (&record.snonce, &record.anonce)
    } else {
        (&record.anonce, &record.snonce)
    };
    pke[35..67].copy_from_slice(nonce_lo);
    pke[67..99].copy_from_slice(nonce_hi);

    pke[PKE_COUNTER] = 0x00;
    // 0x80 terminator and the bit length of a 64-byte key block + 100 bytes
    pke[100] = 0x80;
    pke[126] = 0x05;
    pke[127] = 0x20;
    pke
}

/// Number of SHA1 blocks an EAPOL body of `len` bytes occupies once padded
#[inline]
pub fn eapol_block_count(len: usize) -> usize {
    (len + 9 + SHA1_BLOCK - 1) / SHA1_BLOCK
}

/// Copy the EAPOL body and apply SHA1 padding for the inner HMAC hash.
///
/// The length field counts the 64-byte key block hashed before the body.
pub fn pad_eapol(eapol: &[u8]) -> Result<([u8; EAPOL_BUF_LEN], usize)> {
    if eapol.len() > MAX_EAPOL_LEN {
        return Err(DriverError::Capture(format!(
            "EAPOL body of {} bytes exceeds {}",
            eapol.len(),
            MAX_EAPOL_LEN
        )));
    }

    let mut buf = [0u8; EAPOL_BUF_LEN];
    let len = eapol.len();
    buf[..len].copy_from_slice(eapol);
    buf[len] = 0x80;

    let blocks = eapol_block_count(len);
    let bits = ((len + SHA1_BLOCK) * 8) as u32;
    let end = blocks * SHA1_BLOCK;
    buf[end - 4..end].copy_from_slice(&bits.to_be_bytes());

    Ok((buf, blocks))
}

/// Hash schedule for the device core
pub fn build_microcode(eapol_blocks: usize) -> [u8; MICROCODE_LEN] {
    let mut uc: Vec<u8> = Vec::with_capacity(MICROCODE_LEN);

    // PTK: inner hash over the PKE block, then outer hash
    uc.push(UC_SEL_CNT | UC_NO_WB | UC_SEL_SCRATCH_ZERO | UC_XOR_36);
    uc.push(UC_SEL_OUT | UC_NO_WB | uc_sel_reg(0));
    uc.push(UC_SEL_OUT | UC_NO_WB | uc_sel_reg(1));
    uc.push(UC_SEL_CNT | UC_WB_80 | UC_SEL_SCRATCH_ZERO | UC_XOR_5C);
    uc.push(UC_SEL_OUT | UC_NO_WB | UC_SEL_SCRATCH_PAD);
    uc.push(UC_NOHASH | UC_WB_00);

    // MIC: inner hash over the EAPOL blocks, then outer hash
    uc.push(UC_SEL_CNT | UC_NO_WB | UC_SEL_SCRATCH_ZERO | UC_XOR_36);
    for i in 0..eapol_blocks {
        uc.push(UC_SEL_OUT | UC_NO_WB | uc_sel_reg(2 + i));
    }
    uc.push(UC_SEL_CNT | UC_WB_80 | UC_SEL_SCRATCH_ZERO | UC_XOR_5C);
    uc.push(UC_SEL_OUT | UC_NO_WB | UC_SEL_SCRATCH_PAD);

    let mut microcode = [UC_NOHASH; MICROCODE_LEN];
    for (slot, op) in microcode.iter_mut().zip(uc) {
        *slot = op;
    }
    microcode
}

/// Everything derived from a handshake that gets loaded into a device
#[derive(Debug, Clone)]
pub struct CryptoMaterial {
    pub pke: [u8; PKE_LEN],
    pub eapol: [u8; EAPOL_BUF_LEN],
    pub eapol_blocks: usize,
    pub microcode: [u8; MICROCODE_LEN],
    pub mic: [u8; 16],
}

impl CryptoMaterial {
    pub fn from_record(record: &HandshakeRecord) -> Result<Self> {
        let (eapol, eapol_blocks) = pad_eapol(&record.eapol)?;
        Ok(Self {
            pke: build_pke(record),
            eapol,
            eapol_blocks,
            microcode: build_microcode(eapol_blocks),
            mic: record.mic,
        })
    }

    /// Data RAM contents: PKE then padded EAPOL
    pub fn ram_image(&self) -> [u8; RAM_LEN] {
        let mut ram = [0u8; RAM_LEN];
        ram[..PKE_LEN].copy_from_slice(&self.pke);
        ram[PKE_LEN..].copy_from_slice(&self.eapol);
        ram
    }

    /// Fill data RAM four bytes per address, then the microcode RAM
    pub fn ram_program(&self) -> Program {
        let ram = self.ram_image();
        let mut program = Program::new();

        for (addr, word) in ram.chunks_exact(4).enumerate() {
            for &b in word {
                program.push(Opcode::WrRegLsb, 0, b);
            }
            program.push(Opcode::WrRegAddr, 0, addr as u8);
        }
        for (i, &b) in self.microcode.iter().enumerate() {
            program.push(Opcode::WrRegLsb, 0, b);
            program.push(Opcode::WrRegAddr, 0, i as u8 | 0x80);
        }

        program
    }

    /// Push the target MIC
    pub fn mic_program(&self) -> Program {
        let mut program = Program::new();
        for &b in &self.mic {
            program.push(Opcode::PushMicByte, 0, b);
        }
        program
    }
}

/// Calculate PMK (Pairwise Master Key) from passphrase and SSID
///
/// PMK = PBKDF2(passphrase, SSID, 4096 iterations, 256 bits)
#[inline]
pub fn calculate_pmk(passphrase: &[u8], ssid: &[u8]) -> [u8; 32] {
    let mut pmk = [0u8; 32];
    let _ = pbkdf2::<HmacSha1>(passphrase, ssid, 4096, &mut pmk);
    pmk
}

/// Calculate PTK (Pairwise Transient Key) from PMK and handshake data
///
/// PTK = PRF-512(PMK, "Pairwise key expansion",
///               min(AA, SPA) || max(AA, SPA) || min(ANonce, SNonce) || max(ANonce, SNonce))
#[inline]
pub fn calculate_ptk(
    pmk: &[u8; 32],
    ap_mac: &[u8; 6],
    client_mac: &[u8; 6],
    anonce: &[u8; 32],
    snonce: &[u8; 32],
) -> [u8; 64] {
    let mut data = [0u8; 76];

    if ap_mac < client_mac {
        data[0..6].copy_from_slice(ap_mac);
        data[6..12].copy_from_slice(client_mac);
    } else {
        data[0..6].copy_from_slice(client_mac);
        data[6..12].copy_from_slice(ap_mac);
    }

    if anonce < snonce {
        data[12..44].copy_from_slice(anonce);
        data[44..76].copy_from_slice(snonce);
    } else {
        data[12..44].copy_from_slice(snonce);
        data[44..76].copy_from_slice(anonce);
    }

    let mut input = [0u8; 100];
    input[..PRF_LABEL.len()].copy_from_slice(PRF_LABEL);
    input[PRF_LABEL.len() + 1..PRF_LABEL.len() + 1 + data.len()].copy_from_slice(&data);
    prf_512(pmk, &mut input)
}

/// PRF-512 over a 100-byte block whose last byte is the counter
#[inline]
fn prf_512(key: &[u8], input: &mut [u8; 100]) -> [u8; 64] {
    let mut result = [0u8; 64];

    for i in 0..4u8 {
        input[PKE_COUNTER] = i;
        let hash = hmac_sha1(key, input);

        let start = i as usize * 20;
        let end = (start + 20).min(64);
        result[start..end].copy_from_slice(&hash[..end - start]);
    }

    result
}

#[inline]
fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// MIC = HMAC-SHA1(KCK, EAPOL_frame)[0..16]  (key version 2)
#[inline]
pub fn calculate_mic(kck: &[u8; 16], eapol_frame: &[u8]) -> [u8; 16] {
    let hash = hmac_sha1(kck, eapol_frame);
    let mut mic = [0u8; 16];
    mic.copy_from_slice(&hash[..16]);
    mic
}

/// Software check of a candidate against the device material.
///
/// Uses the same PKE block the devices hash, so a passing check confirms
/// the buffers as well as the password.
pub fn verify_candidate(password: &[u8], essid: &[u8], material: &CryptoMaterial) -> bool {
    let pmk = calculate_pmk(password, essid);

    let mut input = [0u8; 100];
    input.copy_from_slice(&material.pke[..100]);
    let ptk = prf_512(&pmk, &mut input);

    let mut kck = [0u8; 16];
    kck.copy_from_slice(&ptk[..16]);

    let eapol_len = eapol_len_from_padding(material);
    let calculated = calculate_mic(&kck, &material.eapol[..eapol_len]);
    constant_time_compare_16(&calculated, &material.mic)
}

/// Verify a password directly against a handshake record
pub fn verify_password(password: &[u8], record: &HandshakeRecord) -> bool {
    let pmk = calculate_pmk(password, &record.essid);
    let ptk = calculate_ptk(
        &pmk,
        &record.bssid,
        &record.client_mac,
        &record.anonce,
        &record.snonce,
    );

    let mut kck = [0u8; 16];
    kck.copy_from_slice(&ptk[..16]);

    let calculated = calculate_mic(&kck, &record.eapol);
    constant_time_compare_16(&calculated, &record.mic)
}

/// Recover the body length from the SHA1 length field
fn eapol_len_from_padding(material: &CryptoMaterial) -> usize {
    let end = material.eapol_blocks * SHA1_BLOCK;
    let field = &material.eapol[end - 4..end];
    let bits = u32::from_be_bytes([field[0], field[1], field[2], field[3]]) as usize;
    (bits / 8).saturating_sub(SHA1_BLOCK).min(MAX_EAPOL_LEN)
}

/// Constant-time comparison for 16-byte MIC
#[inline(always)]
fn constant_time_compare_16(a: &[u8; 16], b: &[u8; 16]) -> bool {
    let mut diff = 0u8;
    for i in 0..16 {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}
