/*!
 * Multi-device work coordination
 *
 * One scoped worker thread per device. Each worker walks its stride of
 * charset columns batch by batch: program the starting messages, start,
 * then collect response frames until every unit reported FINISHED.
 *
 * Ctrl-C only raises a flag; workers notice it between reads and return,
 * and the caller resets the boards once every worker has joined.
 */

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::clock::ClockSettings;
use crate::config::RunConfig;
use crate::crypto::{verify_candidate, CryptoMaterial};
use crate::device::{reset, send_program, Device};
use crate::error::{DriverError, Result};
use crate::handshake::HandshakeRecord;
use crate::password_gen::StridePlan;
use crate::protocol::{
    batch_program, charset_program, clock_program, initial_message, ssid_program, Opcode,
    Program, ResponseFrame, ResponseKind, RESPONSE_LEN,
};
use crate::report::{Hit, Reporter};

/// Per-device lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Programming,
    AwaitingResponses,
    /// Stride exhausted or response stream closed
    Done,
    /// Stopped on request
    Shutdown,
}

/// How one worker ended
#[derive(Debug)]
pub struct WorkerSummary {
    pub device: usize,
    pub batches: usize,
    pub hits: usize,
    pub state: WorkerState,
    pub error: Option<DriverError>,
}

/// Software double check of device hits
#[derive(Debug, Clone)]
pub struct HitVerifier {
    essid: Vec<u8>,
    material: CryptoMaterial,
}

impl HitVerifier {
    pub fn new(essid: &[u8], material: CryptoMaterial) -> Self {
        Self {
            essid: essid.to_vec(),
            material,
        }
    }

    pub fn check(&self, password: &[u8]) -> bool {
        verify_candidate(password, &self.essid, &self.material)
    }
}

/// Handshake-dependent setup: SSID, RAM and microcode, MIC, charset,
/// prefix offset and device-walked length
pub fn setup_program(
    record: &HandshakeRecord,
    material: &CryptoMaterial,
    config: &RunConfig,
) -> Program {
    let mut program = ssid_program(&record.essid);
    program.append(material.ram_program());
    program.append(material.mic_program());
    program.append(charset_program(config.charset().as_bytes()));
    program.push(Opcode::SetOffset, 0, config.prefix().len() as u8);
    program.push(Opcode::SelMsgLen, 0, config.device_chars() as u8);
    program
}

enum FrameRead {
    Frame([u8; RESPONSE_LEN]),
    Closed,
    Cancelled,
}

pub struct Coordinator<'a> {
    config: &'a RunConfig,
    reporter: &'a Reporter,
    cancel: Arc<AtomicBool>,
    verifier: Option<HitVerifier>,
}

impl<'a> Coordinator<'a> {
    pub fn new(config: &'a RunConfig, reporter: &'a Reporter, cancel: Arc<AtomicBool>) -> Self {
        Self {
            config,
            reporter,
            cancel,
            verifier: None,
        }
    }

    pub fn with_verifier(mut self, verifier: HitVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    #[inline]
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Program the PLL on every device, then wait for the clocks to settle.
    ///
    /// Devices that fail are dropped, see [`Coordinator::prepare`].
    pub fn clock_devices<D: Device>(
        &self,
        devices: &mut Vec<D>,
        clock: &ClockSettings,
        settle: Duration,
    ) -> Vec<DriverError> {
        let program = clock_program(clock.multiplier, clock.divider);
        info!(
            "Clock M={} D={} ({:.2} MHz)",
            clock.multiplier, clock.divider, clock.frequency_mhz
        );
        let failures = self.prepare(devices, &program);
        if !settle.is_zero() && !devices.is_empty() {
            std::thread::sleep(settle);
        }
        failures
    }

    /// Flush each device and send it the same program; stops at the first failure
    pub fn broadcast<D: Device>(&self, devices: &mut [D], program: &Program) -> Result<()> {
        for (index, device) in devices.iter_mut().enumerate() {
            self.send_setup(index, device, program)?;
        }
        Ok(())
    }

    /// Like [`Coordinator::broadcast`], but a device that fails is reset and
    /// removed from `devices` while the others keep going
    pub fn prepare<D: Device>(&self, devices: &mut Vec<D>, program: &Program) -> Vec<DriverError> {
        let mut failures = Vec::new();
        let mut index = 0;
        devices.retain_mut(|device| {
            let outcome = self.send_setup(index, device, program);
            index += 1;
            match outcome {
                Ok(()) => true,
                Err(e) => {
                    warn!("Dropping {}: {}", device.describe(), e);
                    // Best effort, the device already failed once
                    let _ = reset(device);
                    failures.push(e);
                    false
                }
            }
        });
        failures
    }

    fn send_setup<D: Device>(&self, index: usize, device: &mut D, program: &Program) -> Result<()> {
        let name = device.describe();
        let io_error = |e: io::Error| DriverError::DeviceIo {
            device: index,
            reason: format!("{}: {}", name, e),
        };
        device.flush().map_err(io_error)?;
        send_program(device, program).map_err(io_error)?;
        debug!("Sent {} words to {}", program.len(), name);
        Ok(())
    }

    /// Run one worker per device until every stride is done or a stop is requested
    pub fn run<D: Device>(&self, devices: &mut [D]) -> Vec<WorkerSummary> {
        let total = devices.len();

        std::thread::scope(|scope| {
            let handles: Vec<_> = devices
                .iter_mut()
                .enumerate()
                .map(|(index, device)| scope.spawn(move || self.worker(index, total, device)))
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(index, handle)| {
                    handle.join().unwrap_or_else(|_| WorkerSummary {
                        device: index,
                        batches: 0,
                        hits: 0,
                        state: WorkerState::Done,
                        error: Some(DriverError::DeviceIo {
                            device: index,
                            reason: "worker thread panicked".to_string(),
                        }),
                    })
                })
                .collect()
        })
    }

    /// Send RESET to every device; failures are only logged
    pub fn reset_all<D: Device>(&self, devices: &mut [D]) {
        for device in devices.iter_mut() {
            if let Err(e) = reset(device) {
                warn!("Reset of {} failed: {}", device.describe(), e);
            }
        }
    }

    fn worker<D: Device>(&self, index: usize, total: usize, device: &mut D) -> WorkerSummary {
        let mut summary = WorkerSummary {
            device: index,
            batches: 0,
            hits: 0,
            state: WorkerState::Idle,
            error: None,
        };

        let plan = StridePlan::new(index, total, self.config.units(), self.config.charset().len());
        self.reporter.device_started(
            index,
            &device.describe(),
            plan.start(),
            plan.step(),
            self.config.charset().len(),
        );

        if let Err(e) = self.walk(&plan, device, &mut summary) {
            self.reporter.device_failed(index, &e);
            summary.error = Some(e);
        }

        debug!("Device {} stopped in state {:?}", index, summary.state);
        summary
    }

    fn walk<D: Device>(
        &self,
        plan: &StridePlan,
        device: &mut D,
        summary: &mut WorkerSummary,
    ) -> Result<()> {
        let index = summary.device;

        for base in plan.bases() {
            if self.cancelled() {
                summary.state = WorkerState::Shutdown;
                return Ok(());
            }

            summary.state = WorkerState::Programming;
            let program = batch_program(base, self.config)?;
            for unit in 0..self.config.units() {
                let message = initial_message(base + unit, self.config)?;
                self.reporter.initial_message(index, unit, &message);
            }
            send_program(device, &program).map_err(|e| DriverError::DeviceIo {
                device: index,
                reason: format!("write failed: {}", e),
            })?;

            summary.state = WorkerState::AwaitingResponses;
            let mut outstanding = self.config.units();
            while outstanding > 0 {
                let raw = match self.read_frame(index, device)? {
                    FrameRead::Frame(raw) => raw,
                    FrameRead::Closed => {
                        info!("Device {} response stream closed", index);
                        summary.state = WorkerState::Done;
                        return Ok(());
                    }
                    FrameRead::Cancelled => {
                        summary.state = WorkerState::Shutdown;
                        return Ok(());
                    }
                };

                let frame = ResponseFrame::decode(&raw);
                match frame.kind() {
                    ResponseKind::Hit => {
                        self.on_hit(index, base, &frame);
                        summary.hits += 1;
                    }
                    ResponseKind::Finished => {
                        self.reporter.batch_finished(index, frame.unit, frame.payload);
                        outstanding -= 1;
                    }
                    ResponseKind::Unknown(kind) => {
                        warn!("{}", DriverError::MalformedResponse(raw));
                        debug!("Unknown response kind {:#04x}", kind);
                        self.reporter.malformed(index, &raw);
                    }
                }
            }

            summary.batches += 1;
        }

        summary.state = WorkerState::Done;
        self.reporter.device_done(index, summary.batches);
        Ok(())
    }

    fn on_hit(&self, index: usize, base: usize, frame: &ResponseFrame) {
        let unit_id = (base + frame.unit as usize) as u64;
        let plaintext = self.config.plaintext(unit_id, frame.payload as u64);
        let verified = self.verifier.as_ref().map(|v| v.check(&plaintext));

        self.reporter.hit(Hit {
            device: index,
            unit: frame.unit,
            unit_id,
            match_code: frame.payload,
            plaintext,
            verified,
            at: Local::now(),
        });
    }

    /// Assemble one 5-byte frame from possibly partial reads
    fn read_frame<D: Device>(&self, index: usize, device: &mut D) -> Result<FrameRead> {
        let policy = self.config.read_policy();
        let mut raw = [0u8; RESPONSE_LEN];
        let mut filled = 0;
        let mut failures = 0u32;
        let mut last_progress = Instant::now();

        while filled < RESPONSE_LEN {
            if self.cancelled() {
                return Ok(FrameRead::Cancelled);
            }

            match device.read(&mut raw[filled..]) {
                Ok(0) => {}
                Ok(n) => {
                    filled += n;
                    failures = 0;
                    last_progress = Instant::now();
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(FrameRead::Closed);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Error reading device {} ({}/{}): {}",
                        index, failures, policy.max_retries, e
                    );
                    if failures > policy.max_retries {
                        return Err(DriverError::DeviceIo {
                            device: index,
                            reason: format!("read failed {} times: {}", failures, e),
                        });
                    }
                    continue;
                }
            }

            if let Some(timeout) = policy.timeout {
                if last_progress.elapsed() >= timeout {
                    return Err(DriverError::DeviceIo {
                        device: index,
                        reason: format!("no response for {:?}", timeout),
                    });
                }
            }
        }

        Ok(FrameRead::Frame(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReadPolicy, RunConfigBuilder};
    use crate::device::{ReadEvent, ScriptedDevice};
    use crate::protocol::encode;
    use crate::report::tests::SharedBuffer;

    const FINISHED: u8 = 0x1F;
    const HIT: u8 = 0x01;

    fn frame(payload: u32, kind: u8, unit: u8) -> [u8; 5] {
        let p = payload.to_le_bytes();
        [p[0], p[1], p[2], p[3], kind | (unit << 5)]
    }

    fn config(units: usize) -> RunConfig {
        RunConfigBuilder::new("abcd", 2).units(units).build().unwrap()
    }

    fn reporter() -> (Reporter, SharedBuffer) {
        let buf = SharedBuffer::default();
        (Reporter::with_writer(Box::new(buf.clone()), false), buf)
    }

    fn batches(bases: &[usize], cfg: &RunConfig) -> Vec<u8> {
        bases
            .iter()
            .flat_map(|&b| batch_program(b, cfg).unwrap().to_bytes())
            .collect()
    }

    #[test]
    fn test_single_device_walk_and_hit() {
        let cfg = config(2);
        let (reporter, out) = reporter();
        let coordinator = Coordinator::new(&cfg, &reporter, Arc::new(AtomicBool::new(false)));

        let mut devices = vec![ScriptedDevice::new("a")
            .respond(frame(0, FINISHED, 0))
            .respond(frame(1, HIT, 1))
            .respond(frame(0, FINISHED, 1))
            .respond(frame(0, FINISHED, 1))
            .respond(frame(0, FINISHED, 0))];

        let summaries = coordinator.run(&mut devices);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].state, WorkerState::Done);
        assert_eq!(summaries[0].batches, 2);
        assert_eq!(summaries[0].hits, 1);
        assert!(summaries[0].error.is_none());

        assert_eq!(devices[0].written(), batches(&[0, 2], &cfg).as_slice());

        let hits = reporter.hits();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].unit_id, 1);
        assert_eq!(hits[0].plaintext, b"bb");
        assert!(out.text().contains("Batch finished!"));
    }

    #[test]
    fn test_two_devices_split_columns() {
        let cfg = config(2);
        let (reporter, _) = reporter();
        let coordinator = Coordinator::new(&cfg, &reporter, Arc::new(AtomicBool::new(false)));

        let mut devices: Vec<ScriptedDevice> = (0..2)
            .map(|i| {
                ScriptedDevice::new(&i.to_string())
                    .respond(frame(0, FINISHED, 0))
                    .respond(frame(0, FINISHED, 1))
            })
            .collect();

        let summaries = coordinator.run(&mut devices);
        assert!(summaries.iter().all(|s| s.batches == 1 && s.state == WorkerState::Done));
        assert_eq!(devices[0].written(), batches(&[0], &cfg).as_slice());
        assert_eq!(devices[1].written(), batches(&[2], &cfg).as_slice());
    }

    #[test]
    fn test_partial_reads_and_malformed_frames() {
        let cfg = config(1);
        let (reporter, out) = reporter();
        let coordinator = Coordinator::new(&cfg, &reporter, Arc::new(AtomicBool::new(false)));

        let mut stream = Vec::new();
        for base in 0..4u32 {
            if base == 1 {
                stream.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x05]);
            }
            stream.extend_from_slice(&frame(base, FINISHED, 0));
        }
        let mut devices = vec![ScriptedDevice::new("slow")
            .then(ReadEvent::Idle)
            .respond_split(&stream, 2)];

        let summaries = coordinator.run(&mut devices);
        assert_eq!(summaries[0].batches, 4);
        assert_eq!(summaries[0].state, WorkerState::Done);
        assert!(out.text().contains("deadbeef05"));
    }

    #[test]
    fn test_closed_stream_ends_worker() {
        let cfg = config(2);
        let (reporter, _) = reporter();
        let coordinator = Coordinator::new(&cfg, &reporter, Arc::new(AtomicBool::new(false)));

        let mut devices = vec![ScriptedDevice::new("sink")];
        let summaries = coordinator.run(&mut devices);
        assert_eq!(summaries[0].state, WorkerState::Done);
        assert_eq!(summaries[0].batches, 0);
        assert!(summaries[0].error.is_none());
        assert_eq!(devices[0].written(), batches(&[0], &cfg).as_slice());
    }

    #[test]
    fn test_cancel_before_start() {
        let cfg = config(2);
        let (reporter, _) = reporter();
        let cancel = Arc::new(AtomicBool::new(true));
        let coordinator = Coordinator::new(&cfg, &reporter, cancel);

        let mut devices = vec![ScriptedDevice::new("a")];
        let summaries = coordinator.run(&mut devices);
        assert_eq!(summaries[0].state, WorkerState::Shutdown);
        assert!(devices[0].written().is_empty());

        coordinator.reset_all(&mut devices);
        assert_eq!(devices[0].written(), &[0, 0]);
    }

    /// Raises the stop flag on its first read, as Ctrl-C would mid-batch
    struct StopOnRead {
        inner: ScriptedDevice,
        cancel: Arc<AtomicBool>,
    }

    impl Device for StopOnRead {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.inner.write_all(bytes)
        }

        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            self.cancel.store(true, Ordering::SeqCst);
            Ok(0)
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }
    }

    #[test]
    fn test_cancel_while_awaiting_responses() {
        let cfg = config(2);
        let (reporter, _) = reporter();
        let cancel = Arc::new(AtomicBool::new(false));
        let coordinator = Coordinator::new(&cfg, &reporter, cancel.clone());

        let mut devices = vec![StopOnRead {
            inner: ScriptedDevice::new("a"),
            cancel,
        }];
        let summaries = coordinator.run(&mut devices);
        assert_eq!(summaries[0].state, WorkerState::Shutdown);
        assert_eq!(summaries[0].batches, 0);
        assert!(summaries[0].error.is_none());
        // Only the first batch went out
        assert_eq!(devices[0].inner.written(), batches(&[0], &cfg).as_slice());

        coordinator.reset_all(&mut devices);
        let mut expected = batches(&[0], &cfg);
        expected.extend_from_slice(&[0, 0]);
        assert_eq!(devices[0].inner.written(), expected.as_slice());
    }

    #[test]
    fn test_prepare_drops_failed_device() {
        let cfg = config(2);
        let (reporter, _) = reporter();
        let coordinator = Coordinator::new(&cfg, &reporter, Arc::new(AtomicBool::new(false)));
        let program = charset_program(b"abcd");

        let mut devices = vec![
            ScriptedDevice::new("a"),
            ScriptedDevice::new("broken").failing_writes(),
            ScriptedDevice::new("c"),
        ];
        let failures = coordinator.prepare(&mut devices, &program);

        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], DriverError::DeviceIo { device: 1, .. }));
        assert_eq!(devices.len(), 2);
        for dev in &devices {
            assert_eq!(dev.written(), program.to_bytes().as_slice());
        }
        assert_eq!(devices[1].describe(), "scripted c");
    }

    #[test]
    fn test_write_failure_is_isolated() {
        let cfg = config(2);
        let (reporter, _) = reporter();
        let coordinator = Coordinator::new(&cfg, &reporter, Arc::new(AtomicBool::new(false)));

        let mut devices = vec![
            ScriptedDevice::new("ok")
                .respond(frame(0, FINISHED, 0))
                .respond(frame(0, FINISHED, 1)),
            ScriptedDevice::new("broken").failing_writes(),
        ];

        let summaries = coordinator.run(&mut devices);
        assert!(summaries[0].error.is_none());
        assert_eq!(summaries[0].batches, 1);
        assert!(matches!(
            summaries[1].error,
            Some(DriverError::DeviceIo { device: 1, .. })
        ));
    }

    #[test]
    fn test_read_retries_exhausted() {
        let cfg = RunConfigBuilder::new("abcd", 2)
            .units(1)
            .read_policy(ReadPolicy {
                max_retries: 2,
                timeout: None,
            })
            .build()
            .unwrap();
        let (reporter, _) = reporter();
        let coordinator = Coordinator::new(&cfg, &reporter, Arc::new(AtomicBool::new(false)));

        let mut devices = vec![ScriptedDevice::new("flaky")
            .then(ReadEvent::Error(io::ErrorKind::Other))
            .then(ReadEvent::Error(io::ErrorKind::Other))
            .then(ReadEvent::Error(io::ErrorKind::Other))];

        let summaries = coordinator.run(&mut devices);
        assert!(matches!(
            summaries[0].error,
            Some(DriverError::DeviceIo { device: 0, .. })
        ));
    }

    #[test]
    fn test_transient_read_errors_recover() {
        let cfg = config(1);
        let (reporter, _) = reporter();
        let coordinator = Coordinator::new(&cfg, &reporter, Arc::new(AtomicBool::new(false)));

        let mut dev = ScriptedDevice::new("flaky").then(ReadEvent::Error(io::ErrorKind::Other));
        for base in 0..4u32 {
            dev = dev
                .then(ReadEvent::Error(io::ErrorKind::Interrupted))
                .respond(frame(base, FINISHED, 0));
        }
        let mut devices = vec![dev];

        let summaries = coordinator.run(&mut devices);
        assert!(summaries[0].error.is_none());
        assert_eq!(summaries[0].batches, 4);
    }

    #[test]
    fn test_read_timeout() {
        let cfg = RunConfigBuilder::new("abcd", 2)
            .read_policy(ReadPolicy {
                max_retries: 8,
                timeout: Some(Duration::ZERO),
            })
            .build()
            .unwrap();
        let (reporter, _) = reporter();
        let coordinator = Coordinator::new(&cfg, &reporter, Arc::new(AtomicBool::new(false)));

        let mut devices = vec![ScriptedDevice::new("silent").then(ReadEvent::Idle)];
        let summaries = coordinator.run(&mut devices);
        assert!(matches!(summaries[0].error, Some(DriverError::DeviceIo { .. })));
    }

    #[test]
    fn test_setup_program_tail() {
        let cfg = RunConfigBuilder::new("a-z", 8).prefix("ab").build().unwrap();
        let record = HandshakeRecord {
            essid: b"TestNet".to_vec(),
            eapol: vec![1; 121],
            ..Default::default()
        };
        let material = CryptoMaterial::from_record(&record).unwrap();
        let program = setup_program(&record, &material, &cfg);

        let words = program.words();
        assert_eq!(words[0], encode(Opcode::SetSsidLen, 0, 7));
        assert_eq!(words[words.len() - 2], encode(Opcode::SetOffset, 0, 2));
        assert_eq!(words[words.len() - 1], encode(Opcode::SelMsgLen, 0, 7));
        assert_eq!(words[words.len() - 3], encode(Opcode::SetMapLen, 0, 26));
    }

    #[test]
    fn test_clock_broadcast() {
        let cfg = config(2);
        let (reporter, _) = reporter();
        let coordinator = Coordinator::new(&cfg, &reporter, Arc::new(AtomicBool::new(false)));
        let clock = crate::clock::solve(25, 100).unwrap();

        let mut devices = vec![ScriptedDevice::new("a"), ScriptedDevice::new("b")];
        let failures = coordinator.clock_devices(&mut devices, &clock, Duration::ZERO);
        assert!(failures.is_empty());
        assert_eq!(devices.len(), 2);
        for dev in &devices {
            assert_eq!(dev.written(), clock_program(19, 4).to_bytes().as_slice());
        }
    }
}
