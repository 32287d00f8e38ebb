//! Default bus connections.
//!
//! The process lazily gets one [`Connection`] per bus address, shared by
//! every task and thread that asks for it. A connection that failed to come
//! up is still returned (disconnected) so callers can hold on to it and
//! [`Connection::reconnect`] later.

use crate::config::BusConfig;
use crate::connection::Connection;
use crate::error::{self, BusError};
use crate::transport::{Transport, ZbusTransport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;

/// Reply timeout used when none is configured (the libdbus default).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(25_000);

/// Which bus to talk to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BusAddress {
    Session,
    System,
    /// An explicit D-Bus address, e.g. `unix:path=/run/user/1000/bus`.
    Address(String),
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusAddress::Session => f.write_str("session"),
            BusAddress::System => f.write_str("system"),
            BusAddress::Address(address) => f.write_str(address),
        }
    }
}

impl FromStr for BusAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("Bus address cannot be empty".to_string()),
            "session" => Ok(BusAddress::Session),
            "system" => Ok(BusAddress::System),
            address if address.contains(':') => Ok(BusAddress::Address(address.to_string())),
            other => Err(format!(
                "Unknown bus '{}': expected session, system or a D-Bus address",
                other
            )),
        }
    }
}

impl From<BusAddress> for String {
    fn from(address: BusAddress) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for BusAddress {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

fn default_buses() -> &'static Mutex<HashMap<BusAddress, Connection>> {
    static DEFAULT_BUSES: OnceLock<Mutex<HashMap<BusAddress, Connection>>> = OnceLock::new();
    DEFAULT_BUSES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The process-wide connection to `address`, created on first use.
pub async fn default_bus(address: &BusAddress) -> Connection {
    // Held across the connect so concurrent first callers share one connection
    let mut buses = default_buses().lock().await;
    if let Some(connection) = buses.get(address) {
        return connection.clone();
    }

    let transport = ZbusTransport::connect(address, DEFAULT_CALL_TIMEOUT).await;
    let connection = Connection::new(Arc::new(transport));
    buses.insert(address.clone(), connection.clone());
    connection
}

/// Open a private connection as configured.
///
/// Unlike [`default_bus`] this fails if the bus cannot be reached.
pub async fn open(config: &BusConfig) -> error::Result<Connection> {
    let address = config.address()?;
    let transport = ZbusTransport::connect(&address, config.call_timeout()).await;
    if !transport.is_connected() {
        return Err(transport
            .last_error()
            .unwrap_or_else(BusError::disconnected)
            .into());
    }
    Ok(Connection::new(Arc::new(transport)))
}

/// The system bus connection.
pub async fn system_bus() -> Connection {
    default_bus(&BusAddress::System).await
}

/// The session bus connection.
pub async fn session_bus() -> Connection {
    default_bus(&BusAddress::Session).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        assert_eq!("session".parse::<BusAddress>().unwrap(), BusAddress::Session);
        assert_eq!(" system ".parse::<BusAddress>().unwrap(), BusAddress::System);
        assert_eq!(
            "unix:path=/run/bus".parse::<BusAddress>().unwrap(),
            BusAddress::Address("unix:path=/run/bus".into())
        );
        assert!("".parse::<BusAddress>().is_err());
        assert!("sesion".parse::<BusAddress>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for address in [
            BusAddress::Session,
            BusAddress::System,
            BusAddress::Address("tcp:host=localhost,port=4000".into()),
        ] {
            assert_eq!(address.to_string().parse::<BusAddress>().unwrap(), address);
        }
    }

    #[test]
    fn test_serde_as_string() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            bus: BusAddress,
        }

        let parsed: Wrapper = toml::from_str("bus = \"system\"").unwrap();
        assert_eq!(parsed.bus, BusAddress::System);
        assert!(toml::from_str::<Wrapper>("bus = \"bogus\"").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_default_bus_is_shared_across_threads() {
        let address = BusAddress::Address("unix:path=/nonexistent/busline-default-bus".into());
        let first = default_bus(&address).await;
        let second = default_bus(&address).await;
        assert!(!first.is_connected());
        assert!(first.same_connection(&second));

        let other = address.clone();
        let from_thread = std::thread::spawn(move || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(default_bus(&other))
        })
        .join()
        .unwrap();
        assert!(first.same_connection(&from_thread));

        let spawned = tokio::spawn(async move { default_bus(&address).await })
            .await
            .unwrap();
        assert!(first.same_connection(&spawned));
    }

    #[tokio::test]
    async fn test_open_fails_without_bus() {
        let config = BusConfig {
            default: "unix:path=/nonexistent/busline-open".into(),
            ..BusConfig::default()
        };
        let result = open(&config).await;
        assert!(matches!(result, Err(error::Error::Bus(_))));

        let config = BusConfig {
            default: "nowhere".into(),
            ..BusConfig::default()
        };
        assert!(matches!(open(&config).await, Err(error::Error::Config(_))));
    }
}
