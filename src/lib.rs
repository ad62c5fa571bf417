// Public exports for the binary and integration tests
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod device;
pub mod error;
pub mod handshake;
pub mod password_gen;
pub mod platform;
pub mod protocol;
pub mod report;

pub use config::{ParsePolicy, ReadPolicy, RunConfig, RunConfigBuilder};
pub use coordinator::{setup_program, Coordinator, HitVerifier, WorkerState, WorkerSummary};
pub use crypto::{verify_password, CryptoMaterial};
pub use device::{Device, FileSink};
pub use error::{DriverError, Result};
pub use handshake::{parse_mac, read_capture, Extraction, HandshakeExtractor, HandshakeRecord};
pub use platform::UartDevice;
