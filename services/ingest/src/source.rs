//! Byte stream sources: the serial port, or an already-open reader.

use crate::config::SerialConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

/// Shown when the serial device cannot be opened on a Raspberry Pi.
pub const SERIAL_CONSOLE_HINT: &str = "On a Raspberry Pi, disable the serial login console: \
sudo raspi-config -> Interface Options -> Serial Port -> login shell: No, hardware: Yes";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to open {target}: {message}")]
    Open { target: String, message: String },

    #[error("Stream {0} was already taken")]
    AlreadyOpened(String),
}

/// Something that can be opened once into an async byte stream.
#[async_trait]
pub trait StreamSource: Send + Sync {
    type Stream: AsyncRead + Unpin + Send + 'static;

    async fn open(&self) -> Result<Self::Stream, SourceError>;

    fn describe(&self) -> String;
}

/// Serial device opened at a fixed baud rate.
pub struct SerialSource {
    config: SerialConfig,
}

impl SerialSource {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StreamSource for SerialSource {
    type Stream = SerialStream;

    async fn open(&self) -> Result<SerialStream, SourceError> {
        let stream = tokio_serial::new(&self.config.path, self.config.baud_rate)
            .timeout(self.config.read_timeout())
            .open_native_async()
            .map_err(|e| SourceError::Open {
                target: self.describe(),
                message: e.to_string(),
            })?;

        info!(
            path = %self.config.path,
            baud_rate = self.config.baud_rate,
            "Serial port opened"
        );
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.config.path, self.config.baud_rate)
    }
}

/// Hands out a stream that is already open, exactly once.
///
/// Used for stdin (`serial.path = "-"`), pipes, and tests.
pub struct PreparedSource<R> {
    stream: Mutex<Option<R>>,
    name: String,
}

impl<R> PreparedSource<R> {
    pub fn new(stream: R, name: impl Into<String>) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            name: name.into(),
        }
    }
}

#[async_trait]
impl<R> StreamSource for PreparedSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    type Stream = R;

    async fn open(&self) -> Result<R, SourceError> {
        self.stream
            .lock()
            .take()
            .ok_or_else(|| SourceError::AlreadyOpened(self.name.clone()))
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepared_source_opens_once() {
        let source = PreparedSource::new(tokio::io::empty(), "empty");
        assert!(source.open().await.is_ok());
        assert!(matches!(
            source.open().await,
            Err(SourceError::AlreadyOpened(name)) if name == "empty"
        ));
    }

    #[tokio::test]
    async fn test_missing_serial_device_fails_to_open() {
        let source = SerialSource::new(SerialConfig {
            path: "/dev/does-not-exist-telemetry".to_string(),
            ..SerialConfig::default()
        });

        match source.open().await {
            Err(SourceError::Open { target, .. }) => {
                assert!(target.starts_with("/dev/does-not-exist-telemetry"))
            }
            other => panic!("expected open failure, got {:?}", other.map(|_| ())),
        }
    }
}
