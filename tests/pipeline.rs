mod common;

use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use wpa_fpga_driver::crypto::{calculate_mic, calculate_pmk, calculate_ptk, CryptoMaterial};
use wpa_fpga_driver::handshake::{read_capture, MASK_COMPLETE};
use wpa_fpga_driver::protocol::batch_program;
use wpa_fpga_driver::report::Reporter;
use wpa_fpga_driver::{
    setup_program, Coordinator, DriverError, HitVerifier, ParsePolicy, RunConfig,
    RunConfigBuilder, WorkerState,
};

use common::BoardStub;

const BSSID: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
const CLIENT: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
const ANONCE: [u8; 32] = [0x11; 32];
const SNONCE: [u8; 32] = [0x22; 32];
const ESSID: &[u8] = b"TestNet";

fn beacon() -> Vec<u8> {
    let mut f = vec![0x80, 0x00, 0x00, 0x00];
    f.extend_from_slice(&[0xFF; 6]);
    f.extend_from_slice(&BSSID);
    f.extend_from_slice(&BSSID);
    f.extend_from_slice(&[0x00, 0x00]);
    f.extend_from_slice(&[0u8; 12]);
    f.push(0);
    f.push(ESSID.len() as u8);
    f.extend_from_slice(ESSID);
    f
}

fn key_body(key_info: [u8; 2], nonce: &[u8; 32]) -> Vec<u8> {
    let mut key = vec![0u8; 121];
    key[0] = 0x01;
    key[1] = 0x03;
    key[2..4].copy_from_slice(&117u16.to_be_bytes());
    key[4] = 0x02;
    key[5] = key_info[0];
    key[6] = key_info[1];
    key[17..49].copy_from_slice(nonce);
    key[97..99].copy_from_slice(&[0x00, 0x16]);
    key
}

fn data_frame(addr1: [u8; 6], addr2: [u8; 6], key: &[u8]) -> Vec<u8> {
    let mut f = vec![0x88, 0x01, 0x00, 0x00];
    f.extend_from_slice(&addr1);
    f.extend_from_slice(&addr2);
    f.extend_from_slice(&BSSID);
    f.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    f.extend_from_slice(&[0xAA, 0xAA, 0x03, 0x00, 0x00, 0x00, 0x88, 0x8E]);
    f.extend_from_slice(key);
    f
}

/// Beacon, message 1 and a message 2 signed with `password`
fn handshake_frames(password: &[u8]) -> Vec<Vec<u8>> {
    let m1 = key_body([0x00, 0x8a], &ANONCE);

    let mut m2 = key_body([0x01, 0x0a], &SNONCE);
    let pmk = calculate_pmk(password, ESSID);
    let ptk = calculate_ptk(&pmk, &BSSID, &CLIENT, &ANONCE, &SNONCE);
    let mut kck = [0u8; 16];
    kck.copy_from_slice(&ptk[..16]);
    let mic = calculate_mic(&kck, &m2);
    m2[81..97].copy_from_slice(&mic);

    vec![
        beacon(),
        data_frame(CLIENT, BSSID, &m1),
        data_frame(BSSID, CLIENT, &m2),
    ]
}

fn write_pcap(path: &Path, frames: &[Vec<u8>]) {
    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(&0xa1b2c3d4u32.to_le_bytes()).unwrap();
    file.write_all(&2u16.to_le_bytes()).unwrap();
    file.write_all(&4u16.to_le_bytes()).unwrap();
    file.write_all(&[0u8; 8]).unwrap();
    file.write_all(&65535u32.to_le_bytes()).unwrap();
    file.write_all(&105u32.to_le_bytes()).unwrap();

    for (i, frame) in frames.iter().enumerate() {
        file.write_all(&(i as u32).to_le_bytes()).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap();
        file.write_all(&(frame.len() as u32).to_le_bytes()).unwrap();
        file.write_all(&(frame.len() as u32).to_le_bytes()).unwrap();
        file.write_all(frame).unwrap();
    }
}

fn pcapng_block(block_type: u32, body: &[u8]) -> Vec<u8> {
    let total = (12 + body.len()) as u32;
    let mut block = Vec::new();
    block.extend_from_slice(&block_type.to_le_bytes());
    block.extend_from_slice(&total.to_le_bytes());
    block.extend_from_slice(body);
    block.extend_from_slice(&total.to_le_bytes());
    block
}

/// pcapng with one radiotap interface
fn write_pcapng(path: &Path, frames: &[Vec<u8>]) {
    let mut out = Vec::new();

    let mut shb = Vec::new();
    shb.extend_from_slice(&0x1A2B3C4Du32.to_le_bytes());
    shb.extend_from_slice(&1u16.to_le_bytes());
    shb.extend_from_slice(&0u16.to_le_bytes());
    shb.extend_from_slice(&(-1i64).to_le_bytes());
    out.extend(pcapng_block(0x0A0D0D0A, &shb));

    let mut idb = Vec::new();
    idb.extend_from_slice(&127u16.to_le_bytes());
    idb.extend_from_slice(&0u16.to_le_bytes());
    idb.extend_from_slice(&65535u32.to_le_bytes());
    out.extend(pcapng_block(1, &idb));

    for frame in frames {
        let mut data = vec![0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00];
        data.extend_from_slice(frame);
        let caplen = data.len() as u32;
        while data.len() % 4 != 0 {
            data.push(0);
        }

        let mut epb = Vec::new();
        epb.extend_from_slice(&0u32.to_le_bytes());
        epb.extend_from_slice(&0u32.to_le_bytes());
        epb.extend_from_slice(&0u32.to_le_bytes());
        epb.extend_from_slice(&caplen.to_le_bytes());
        epb.extend_from_slice(&caplen.to_le_bytes());
        epb.extend_from_slice(&data);
        out.extend(pcapng_block(6, &epb));
    }

    std::fs::write(path, out).unwrap();
}

fn config() -> RunConfig {
    RunConfigBuilder::new("a-z", 8).units(2).build().unwrap()
}

#[test]
fn test_pcap_to_verified_hit() {
    let cfg = config();
    // Unit 1 of the first batch reports match code 12345
    let password = cfg.plaintext(1, 12345);
    assert_eq!(password.len(), 8);

    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("dump.cap");
    write_pcap(&capture, &handshake_frames(&password));

    let extraction = read_capture(&capture, BSSID).unwrap();
    assert_eq!(extraction.mask, MASK_COMPLETE);
    let record = extraction.complete().unwrap();
    assert_eq!(record.essid, ESSID);
    assert_eq!(record.client_mac, CLIENT);
    assert!(wpa_fpga_driver::verify_password(&password, &record));

    let material = CryptoMaterial::from_record(&record).unwrap();
    assert_eq!(material.eapol_blocks, 3);

    let reporter = Reporter::with_writer(Box::new(std::io::sink()), false);
    let coordinator = Coordinator::new(&cfg, &reporter, Arc::new(AtomicBool::new(false)))
        .with_verifier(HitVerifier::new(&record.essid, material.clone()));

    let mut devices = vec![BoardStub::new("board")
        .respond([0x39, 0x30, 0x00, 0x00, 0x21])
        .respond([0x00, 0x00, 0x00, 0x00, 0x1F])
        .respond([0x00, 0x00, 0x00, 0x00, 0x3F])];

    let setup = setup_program(&record, &material, &cfg);
    coordinator.broadcast(&mut devices, &setup).unwrap();
    let summaries = coordinator.run(&mut devices);

    // Script runs out during the second batch
    assert_eq!(summaries[0].state, WorkerState::Done);
    assert_eq!(summaries[0].batches, 1);

    let hits = reporter.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].plaintext, password);
    assert_eq!(hits[0].verified, Some(true));

    let mut expected = setup.to_bytes();
    expected.extend(batch_program(0, &cfg).unwrap().to_bytes());
    expected.extend(batch_program(2, &cfg).unwrap().to_bytes());
    assert_eq!(devices[0].written(), expected.as_slice());
}

#[test]
fn test_pcapng_radiotap_capture() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("dump.pcapng");
    write_pcapng(&capture, &handshake_frames(b"hunter22"));

    let extraction = read_capture(&capture, BSSID).unwrap();
    assert!(extraction.is_complete());
    assert_eq!(extraction.record.anonce, ANONCE);
    assert_eq!(extraction.record.snonce, SNONCE);
}

#[test]
fn test_capture_without_target() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("dump.cap");
    write_pcap(&capture, &handshake_frames(b"hunter22"));

    let extraction = read_capture(&capture, [0x02; 6]).unwrap();
    // Message 1 is taken from any AP
    assert_eq!(extraction.mask, 0b001);
    assert!(matches!(
        extraction.clone().for_run(ParsePolicy::Abort),
        Err(DriverError::ParseIncomplete { mask: 0b001 })
    ));
    let partial = extraction.for_run(ParsePolicy::Continue).unwrap();
    assert_eq!(partial.anonce, ANONCE);
    assert!(partial.essid.is_empty());
}

#[test]
fn test_not_a_capture() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("garbage.cap");
    std::fs::write(&capture, b"definitely not a capture file").unwrap();
    assert!(read_capture(&capture, BSSID).is_err());
}
