/*!
 * Device transports
 *
 * A device is a byte pipe: programs go in, 5-byte response frames come out.
 * Reads may return fewer bytes than asked for, or zero when nothing arrived
 * within the transport's poll interval.
 */

#[cfg(test)]
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::error::{DriverError, Result};
use crate::platform::UartDevice;
use crate::protocol::{encode, Opcode, Program};

/// Byte-level access to one cracking board
pub trait Device: Send {
    /// Write every byte or fail
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means nothing arrived yet;
    /// `UnexpectedEof` means the stream is closed for good.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Drop pending input and output
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn describe(&self) -> String;
}

impl<D: Device + ?Sized> Device for Box<D> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Send a whole program
pub fn send_program<D: Device + ?Sized>(device: &mut D, program: &Program) -> io::Result<()> {
    device.write_all(&program.to_bytes())
}

/// Send a single RESET word
pub fn reset<D: Device + ?Sized>(device: &mut D) -> io::Result<()> {
    device.write_all(&encode(Opcode::Reset, 0, 0).to_le_bytes())
}

/// Dry-run sink: records the command stream to a file, never answers.
///
/// Reads report a closed stream so a worker stops after its first batch.
pub struct FileSink {
    file: File,
    path: String,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|source| DriverError::DeviceOpen {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            file,
            path: path.display().to_string(),
        })
    }
}

impl Device for FileSink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.file, bytes)
    }

    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "file sink produces no responses",
        ))
    }

    fn describe(&self) -> String {
        format!("file {}", self.path)
    }
}

/// Open the boards for a run: a file sink when `test` is given, otherwise
/// one serial device per path
pub fn open_devices(test: Option<&Path>, paths: &[String]) -> Result<Vec<Box<dyn Device>>> {
    if let Some(path) = test {
        let sink: Box<dyn Device> = Box::new(FileSink::create(path)?);
        return Ok(vec![sink]);
    }
    if paths.is_empty() {
        return Err(DriverError::Configuration(
            "no device given (use --dev PATH or --test FILE)".to_string(),
        ));
    }

    let mut devices: Vec<Box<dyn Device>> = Vec::with_capacity(paths.len());
    for path in paths {
        devices.push(Box::new(UartDevice::open(path)?));
    }
    Ok(devices)
}

/// One scripted read outcome
#[cfg(test)]
#[derive(Debug, Clone)]
pub enum ReadEvent {
    Bytes(Vec<u8>),
    /// Nothing arrived during the poll interval
    Idle,
    Error(io::ErrorKind),
}

/// In-memory device replaying scripted responses; records everything written.
///
/// Once the script runs out the stream reports closed.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ScriptedDevice {
    name: String,
    written: Vec<u8>,
    script: VecDeque<ReadEvent>,
    fail_writes: bool,
}

#[cfg(test)]
impl ScriptedDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Queue a response frame, delivered in one read
    pub fn respond(mut self, frame: [u8; 5]) -> Self {
        self.script.push_back(ReadEvent::Bytes(frame.to_vec()));
        self
    }

    /// Queue raw bytes as a sequence of partial reads
    pub fn respond_split(mut self, bytes: &[u8], chunk: usize) -> Self {
        for part in bytes.chunks(chunk.max(1)) {
            self.script.push_back(ReadEvent::Bytes(part.to_vec()));
        }
        self
    }

    pub fn then(mut self, event: ReadEvent) -> Self {
        self.script.push_back(event);
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

#[cfg(test)]
impl Device for ScriptedDevice {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write refused"));
        }
        self.written.extend_from_slice(bytes);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.script.pop_front() {
            Some(ReadEvent::Bytes(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.script.push_front(ReadEvent::Bytes(bytes.split_off(n)));
                }
                Ok(n)
            }
            Some(ReadEvent::Idle) => Ok(0),
            Some(ReadEvent::Error(kind)) => Err(io::Error::new(kind, "scripted read error")),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "script exhausted")),
        }
    }

    fn describe(&self) -> String {
        format!("scripted {}", self.name)
    }
}
