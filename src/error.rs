use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("handshake incomplete (completion mask {mask:#05b}, expected 0b111)")]
    ParseIncomplete { mask: u8 },

    #[error(
        "unsupported key frame (packet type {packet_type:#04x}, key version {key_version}, \
         descriptor {descriptor:#04x})"
    )]
    UnsupportedCipher {
        packet_type: u8,
        key_version: u8,
        descriptor: u8,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cannot open device {path}: {source}")]
    DeviceOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("device {device}: {reason}")]
    DeviceIo { device: usize, reason: String },

    #[error("malformed response {0:02x?}")]
    MalformedResponse([u8; 5]),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
