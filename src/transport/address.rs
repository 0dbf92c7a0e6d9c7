//! Link addresses.
//!
//! | Form | Link |
//! |------|------|
//! | `tcp://host:port` | TCP stream (serial bridges, simulators) |
//! | `serial:///dev/ttyACM0?baud=115200` | serial device, explicit baud rate |
//! | `/dev/ttyACM0`, `COM3` | serial device, baud rate from options |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

use super::ConnectionOptions;

// ============================================================================
// Types
// ============================================================================

/// Any duplex byte stream a connection can run over.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> LinkStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An opened link.
pub type Link = Pin<Box<dyn LinkStream>>;

// ============================================================================
// Address
// ============================================================================

/// Where a device can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Serial device path.
    Serial {
        /// Device path, e.g. `/dev/ttyACM0` or `COM3`.
        path: String,
        /// Baud rate overriding the options, if given in the address.
        baud_rate: Option<u32>,
    },

    /// TCP endpoint.
    Tcp {
        /// Host name or IP.
        host: String,
        /// Port.
        port: u16,
    },
}

impl Address {
    /// Parses an address string.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if a `scheme://` address is not a valid URL
    /// - [`Error::Config`] for unknown schemes, missing ports or bad baud rates
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::config("empty address"));
        }
        if !address.contains("://") {
            return Ok(Self::Serial {
                path: address.to_string(),
                baud_rate: None,
            });
        }

        let url = Url::parse(address)?;
        match url.scheme() {
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| Error::config(format!("missing host in {address}")))?;
                let port = url
                    .port()
                    .ok_or_else(|| Error::config(format!("missing port in {address}")))?;
                Ok(Self::Tcp {
                    host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
                    port,
                })
            }
            "serial" => {
                let path = match url.host_str() {
                    // serial://COM3
                    Some(host) if !host.is_empty() => host.to_string(),
                    _ => url.path().to_string(),
                };
                if path.is_empty() || path == "/" {
                    return Err(Error::config(format!("missing device path in {address}")));
                }

                let mut baud_rate = None;
                for (key, value) in url.query_pairs() {
                    if key == "baud" {
                        let rate = value
                            .parse::<u32>()
                            .map_err(|_| Error::config(format!("invalid baud rate: {value}")))?;
                        baud_rate = Some(rate);
                    }
                }
                Ok(Self::Serial { path, baud_rate })
            }
            other => Err(Error::config(format!("unsupported address scheme: {other}"))),
        }
    }

    /// Opens the link exclusively.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the device or endpoint cannot be opened.
    pub async fn open(&self, options: &ConnectionOptions) -> Result<Link> {
        match self {
            Self::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| self.acquire_error(e))?;
                stream.set_nodelay(true).map_err(|e| self.acquire_error(e))?;
                debug!(address = %self, "TCP link opened");
                Ok(Box::pin(stream))
            }
            Self::Serial { path, baud_rate } => {
                let rate = baud_rate.unwrap_or(options.baud_rate);
                #[cfg_attr(not(unix), allow(unused_mut))]
                let mut port = tokio_serial::new(path.as_str(), rate)
                    .timeout(options.read_timeout)
                    .open_native_async()
                    .map_err(|e| self.acquire_error(e))?;

                #[cfg(unix)]
                port.set_exclusive(true).map_err(|e| self.acquire_error(e))?;

                debug!(address = %self, baud_rate = rate, "Serial link opened");
                Ok(Box::pin(port))
            }
        }
    }

    /// Any failure while acquiring the link.
    fn acquire_error(&self, e: impl fmt::Display) -> Error {
        Error::connection(format!("{self}: {e}"))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial {
                path,
                baud_rate: Some(rate),
            } => write!(f, "serial://{path}?baud={rate}"),
            Self::Serial { path, .. } => f.write_str(path),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
