//! Device endpoint resolution and engine setup shared by the commands.

use std::fmt;
use std::str::FromStr;

use tokio::runtime::Runtime;
use tracing::debug;

use crate::config::{self, Settings};
use crate::error::{Error, Result};
use crate::sync::SyncEngine;
use crate::transport::{AnyTransport, MemoryDevice, ReplTransport};

/// Where the device lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// In-process simulated device. Starts empty on every invocation.
    Simulator,
    /// Raw-REPL bridge reachable over TCP.
    Repl(String),
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("sim") || s.eq_ignore_ascii_case("simulator") {
            return Ok(Self::Simulator);
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Repl(s.to_string()))
            }
            _ => Err(Error::InvalidArgument(format!(
                "device must be `host:port` or `sim`, got {s:?}"
            ))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simulator => write!(f, "sim"),
            Self::Repl(address) => write!(f, "{address}"),
        }
    }
}

impl Endpoint {
    /// Build the transport for this endpoint.
    #[must_use]
    pub fn transport(&self, settings: &Settings) -> AnyTransport {
        match self {
            Self::Simulator => AnyTransport::Memory(MemoryDevice::new()),
            Self::Repl(address) => AnyTransport::Repl(
                ReplTransport::tcp(address.clone()).with_connect_timeout(settings.operation_timeout()),
            ),
        }
    }
}

/// Resolve the endpoint from the flag, environment and settings.
///
/// # Errors
///
/// [`Error::NoDevice`] when nothing is configured, or an invalid endpoint.
pub fn resolve_endpoint(explicit: Option<&str>, settings: &Settings) -> Result<Endpoint> {
    config::resolve_device(explicit, settings)
        .ok_or(Error::NoDevice)?
        .parse()
}

/// Runtime for one command invocation.
///
/// # Errors
///
/// Returns an error if the runtime cannot be built.
pub fn runtime() -> Result<Runtime> {
    Ok(Runtime::new()?)
}

/// Engine connected to the device, ready for browsing and uploads.
pub struct Connected {
    pub engine: SyncEngine<AnyTransport>,
    pub endpoint: Endpoint,
    pub settings: Settings,
}

/// Load settings, open the device and load the mirror.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns configuration errors or the transport error from connecting.
pub async fn connect(explicit: Option<&str>) -> Result<Connected> {
    let settings = config::load_settings()?;
    let endpoint = resolve_endpoint(explicit, &settings)?;
    debug!(%endpoint, "Connecting");

    let engine = SyncEngine::new(endpoint.transport(&settings), settings.engine_config());
    engine.connect().await?;

    Ok(Connected {
        engine,
        endpoint,
        settings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!("sim".parse::<Endpoint>().unwrap(), Endpoint::Simulator);
        assert_eq!(
            "192.168.4.1:23".parse::<Endpoint>().unwrap(),
            Endpoint::Repl("192.168.4.1:23".to_string())
        );
        assert!("localhost".parse::<Endpoint>().is_err());
        assert!(":23".parse::<Endpoint>().is_err());
        assert!("host:port".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_resolve_from_settings() {
        let settings = Settings {
            device: Some("sim".to_string()),
            ..Settings::default()
        };
        // An explicit flag always wins over the environment and the file.
        assert_eq!(
            resolve_endpoint(Some("bridge.local:2323"), &settings).unwrap(),
            Endpoint::Repl("bridge.local:2323".to_string())
        );
    }
}
