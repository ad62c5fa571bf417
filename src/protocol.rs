/*!
 * Device control protocol
 *
 * Commands are 16-bit words sent little-endian, one after another, with no
 * framing or checksums. Layout of a regular word:
 *
 * ```text
 *  15   13 12       8 7            0
 * +-------+----------+--------------+
 * | unit  |  opcode  |   payload    |
 * +-------+----------+--------------+
 * ```
 *
 * RESET is the all-zero word and START the all-ones word. Responses are
 * 5-byte frames: a little-endian u32 payload followed by a status byte
 * (low 5 bits kind, high 3 bits the reporting unit).
 */

use std::fmt;

use crate::config::RunConfig;
use crate::error::{DriverError, Result};

/// Command opcodes understood by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Reset = 0x00,
    SetOffset = 0x01,
    PushMsgByte = 0x02,
    SelMsgLen = 0x03,
    SelSsidByte = 0x04,
    SetSsidByte = 0x05,
    SetSsidLen = 0x06,
    SelMapByte = 0x07,
    SetMapByte = 0x08,
    SetMapLen = 0x09,
    PushMicByte = 0x0A,
    SetClkMVal = 0x0B,
    SetClkDVal = 0x0C,
    WrRegLsb = 0x0E,
    WrRegAddr = 0x0F,
    Start = 0x1F,
}

/// Length of the message register holding prefix + password + postfix
pub const MESSAGE_LEN: usize = 16;

/// Size of the SSID register
pub const SSID_REG_LEN: usize = 32;

/// Most parallel units addressable by the 3-bit unit field
pub const MAX_UNITS: usize = 8;

/// Size in bytes of one response frame
pub const RESPONSE_LEN: usize = 5;

/// Response kind: a unit found a matching candidate
pub const RESP_HIT: u8 = 0x01;
/// Response kind: a unit finished its batch
pub const RESP_FINISHED: u8 = 0x1F;

/// One 16-bit command word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlWord(pub u16);

impl ControlWord {
    #[inline]
    pub fn value(self) -> u16 {
        self.0
    }

    #[inline]
    pub fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for ControlWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Encode a command for `unit`
#[inline]
pub fn encode(op: Opcode, unit: u8, payload: u8) -> ControlWord {
    match op {
        Opcode::Reset => ControlWord(0),
        Opcode::Start => ControlWord(u16::MAX),
        _ => ControlWord(
            ((op as u16 & 0x1F) << 8) | ((unit as u16 & 0x7) << 13) | payload as u16,
        ),
    }
}

/// An ordered command sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    words: Vec<ControlWord>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, op: Opcode, unit: u8, payload: u8) {
        self.words.push(encode(op, unit, payload));
    }

    pub fn append(&mut self, other: Program) {
        self.words.extend(other.words);
    }

    pub fn words(&self) -> &[ControlWord] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Wire bytes, two per word, little-endian
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

impl FromIterator<ControlWord> for Program {
    fn from_iter<I: IntoIterator<Item = ControlWord>>(iter: I) -> Self {
        Self {
            words: iter.into_iter().collect(),
        }
    }
}

/// Load the character map RAM
pub fn charset_program(map: &[u8]) -> Program {
    let mut program = Program::new();
    for (i, &c) in map.iter().enumerate() {
        program.push(Opcode::SelMapByte, 0, i as u8);
        program.push(Opcode::SetMapByte, 0, c);
    }
    program.push(Opcode::SetMapLen, 0, map.len() as u8);
    program
}

/// Load the SSID register.
///
/// The 0x80 marker four bytes past the name mirrors the SHA1 padding
/// position of the PBKDF2 salt block; the device ignores it.
pub fn ssid_program(essid: &[u8]) -> Program {
    let len = essid.len().min(SSID_REG_LEN);
    let mut reg = [0u8; SSID_REG_LEN + 1];
    reg[..len].copy_from_slice(&essid[..len]);
    if len + 4 < reg.len() {
        reg[len + 4] = 0x80;
    }

    let mut program = Program::new();
    program.push(Opcode::SetSsidLen, 0, len as u8);
    for (i, &b) in reg.iter().take(SSID_REG_LEN).enumerate() {
        program.push(Opcode::SelSsidByte, 0, i as u8);
        program.push(Opcode::SetSsidByte, 0, b);
    }
    program
}

/// Build the 16-byte starting message for one parallel unit
pub fn initial_message(column: usize, config: &RunConfig) -> Result<[u8; MESSAGE_LEN]> {
    let prefix = config.prefix();
    let postfix = config.postfix();
    let chars = config.total_chars();
    let length = prefix.len() + chars + postfix.len();
    if length >= MESSAGE_LEN || chars == 0 {
        return Err(DriverError::Configuration(format!(
            "message of {} bytes does not fit the {}-byte register",
            length, MESSAGE_LEN
        )));
    }

    let charset = config.charset();
    let first = charset.get(0).unwrap_or(0);
    let last = prefix.len() + chars - 1;

    let mut msg = [0u8; MESSAGE_LEN];
    for (i, slot) in msg.iter_mut().enumerate() {
        *slot = if i < prefix.len() {
            prefix[i]
        } else if i < last {
            first
        } else if i == last {
            charset.get(column).unwrap_or(0)
        } else if i < length {
            postfix[i - prefix.len() - chars]
        } else {
            0
        };
    }

    Ok(msg)
}

/// Program the starting message of `unit` for charset `column`
pub fn initial_message_program(unit: u8, column: usize, config: &RunConfig) -> Result<Program> {
    let msg = initial_message(column, config)?;
    Ok(msg
        .iter()
        .map(|&b| encode(Opcode::PushMsgByte, unit, b))
        .collect())
}

/// PLL programming, bracketed by resets
pub fn clock_program(multiplier: u8, divider: u8) -> Program {
    let mut program = Program::new();
    program.push(Opcode::Reset, 0, 0);
    program.push(Opcode::SetClkMVal, 0, multiplier);
    program.push(Opcode::SetClkDVal, 0, divider);
    program.push(Opcode::Reset, 0, 0);
    program
}

/// Reset, load one starting message per unit, start
pub fn batch_program(base: usize, config: &RunConfig) -> Result<Program> {
    let mut program = Program::new();
    program.push(Opcode::Reset, 0, 0);
    for unit in 0..config.units() {
        program.append(initial_message_program(unit as u8, base + unit, config)?);
    }
    program.push(Opcode::Start, 0, 0);
    Ok(program)
}

/// Kind of a response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Hit,
    Finished,
    Unknown(u8),
}

/// Decoded 5-byte response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrame {
    pub payload: u32,
    pub kind: u8,
    pub unit: u8,
}

impl ResponseFrame {
    pub fn decode(frame: &[u8; RESPONSE_LEN]) -> Self {
        Self {
            payload: u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]),
            kind: frame[4] & 0x1F,
            unit: (frame[4] >> 5) & 0x7,
        }
    }

    pub fn kind(&self) -> ResponseKind {
        match self.kind {
            RESP_HIT => ResponseKind::Hit,
            RESP_FINISHED => ResponseKind::Finished,
            other => ResponseKind::Unknown(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfigBuilder;

    fn config(prefix: &str, chars: usize, postfix: &str) -> RunConfig {
        RunConfigBuilder::new("a-d", chars)
            .prefix(prefix)
            .postfix(postfix)
            .build()
            .unwrap()
    }

    #[test]
    fn test_fixed_words() {
        assert_eq!(encode(Opcode::Reset, 7, 0xFF).value(), 0);
        assert_eq!(encode(Opcode::Start, 0, 0).value(), 0xFFFF);
    }

    #[test]
    fn test_word_layout() {
        // unit 3 -> bits 13..16, opcode 5 -> bits 8..13, payload low byte
        let word = encode(Opcode::SetSsidByte, 3, 0x42);
        assert_eq!(word.value(), 0x6542);
        assert_eq!(word.value(), (3 << 13) | (5 << 8) | 0x42);
        assert_eq!(word.to_le_bytes(), [0x42, 0x65]);
    }

    #[test]
    fn test_decode_hit() {
        let frame = ResponseFrame::decode(&[0x34, 0x12, 0x00, 0x00, 0xA1]);
        assert_eq!(frame.payload, 0x1234);
        assert_eq!(frame.kind, 1);
        assert_eq!(frame.kind(), ResponseKind::Hit);
        assert_eq!(frame.unit, 5);
    }

    #[test]
    fn test_decode_finished_and_unknown() {
        let frame = ResponseFrame::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0x3F]);
        assert_eq!(frame.payload, u32::MAX);
        assert_eq!(frame.kind(), ResponseKind::Finished);
        assert_eq!(frame.unit, 1);

        let frame = ResponseFrame::decode(&[0, 0, 0, 0, 0x05]);
        assert_eq!(frame.kind(), ResponseKind::Unknown(5));
    }

    #[test]
    fn test_charset_program() {
        let program = charset_program(b"xy");
        let words: Vec<u16> = program.words().iter().map(|w| w.value()).collect();
        assert_eq!(words, vec![0x0700, 0x0878, 0x0701, 0x0879, 0x0902]);
    }

    #[test]
    fn test_ssid_program_marker() {
        let program = ssid_program(b"TestNet");
        assert_eq!(program.len(), 1 + 2 * SSID_REG_LEN);
        assert_eq!(program.words()[0].value(), 0x0607);

        // SET word for register byte 11 carries the 0x80 marker
        let set_11 = program.words()[1 + 2 * 11 + 1];
        assert_eq!(set_11.value(), 0x0580);
        let set_7 = program.words()[1 + 2 * 7 + 1];
        assert_eq!(set_7.value(), 0x0500);
    }

    #[test]
    fn test_ssid_program_long_name() {
        let name = [b'x'; 32];
        let program = ssid_program(&name);
        assert_eq!(program.words()[0].value(), 0x0620);
        assert!(program.words().iter().all(|w| w.value() != 0x0580));
    }

    #[test]
    fn test_initial_message_layout() {
        let cfg = config("pre", 4, "post");
        let msg = initial_message(2, &cfg).unwrap();
        assert_eq!(&msg[..11], b"preaaacpost");
        assert!(msg[11..].iter().all(|&b| b == 0));

        // Column past the charset leaves the slot empty
        let msg = initial_message(9, &cfg).unwrap();
        assert_eq!(msg[6], 0);
    }

    #[test]
    fn test_initial_message_program_unit() {
        let cfg = config("", 2, "");
        let program = initial_message_program(1, 3, &cfg).unwrap();
        assert_eq!(program.len(), MESSAGE_LEN);
        assert_eq!(program.words()[0].value(), 0x2261); // unit 1, 'a'
        assert_eq!(program.words()[1].value(), 0x2264); // unit 1, 'd'
        assert_eq!(program.words()[2].value(), 0x2200);
    }

    #[test]
    fn test_batch_program_shape() {
        let cfg = config("", 3, "");
        let program = batch_program(0, &cfg).unwrap();
        assert_eq!(program.len(), 1 + cfg.units() * MESSAGE_LEN + 1);
        assert_eq!(program.words().first().map(|w| w.value()), Some(0));
        assert_eq!(program.words().last().map(|w| w.value()), Some(0xFFFF));
    }

    #[test]
    fn test_clock_program_bytes() {
        let bytes = clock_program(19, 4).to_bytes();
        assert_eq!(bytes, vec![0x00, 0x00, 0x13, 0x0B, 0x04, 0x0C, 0x00, 0x00]);
    }
}
