use std::collections::VecDeque;
use std::io;

use wpa_fpga_driver::Device;

/// Board stand-in: replays queued response frames, records every write.
///
/// Reports a closed stream once the queue is drained.
pub struct BoardStub {
    name: String,
    pending: VecDeque<u8>,
    written: Vec<u8>,
}

impl BoardStub {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pending: VecDeque::new(),
            written: Vec::new(),
        }
    }

    pub fn respond(mut self, frame: [u8; 5]) -> Self {
        self.pending.extend(frame);
        self
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl Device for BoardStub {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.written.extend_from_slice(bytes);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no more responses"));
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn describe(&self) -> String {
        format!("stub {}", self.name)
    }
}
