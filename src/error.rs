//! Error types.

use crate::codec::CodecError;
use crate::config::ConfigError;
use thiserror::Error;

/// A D-Bus error: an error name such as
/// `org.freedesktop.DBus.Error.ServiceUnknown` plus a human-readable message.
///
/// Errors raised locally (no reply, lost connection) use the same shape so
/// callers only handle one type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct BusError {
    pub name: String,
    pub message: String,
}

impl BusError {
    pub const SERVICE_UNKNOWN: &'static str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const UNKNOWN_OBJECT: &'static str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &'static str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_METHOD: &'static str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_PROPERTY: &'static str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &'static str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const INVALID_ARGS: &'static str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const ACCESS_DENIED: &'static str = "org.freedesktop.DBus.Error.AccessDenied";
    pub const NO_REPLY: &'static str = "org.freedesktop.DBus.Error.NoReply";
    pub const DISCONNECTED: &'static str = "org.freedesktop.DBus.Error.Disconnected";
    pub const FAILED: &'static str = "org.freedesktop.DBus.Error.Failed";

    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn service_unknown(service: &str) -> Self {
        Self::new(
            Self::SERVICE_UNKNOWN,
            format!("The name {} was not provided by any .service files", service),
        )
    }

    pub fn unknown_object(path: &str) -> Self {
        Self::new(Self::UNKNOWN_OBJECT, format!("No such object path '{}'", path))
    }

    pub fn unknown_method(interface: &str, method: &str) -> Self {
        Self::new(
            Self::UNKNOWN_METHOD,
            format!("No such method '{}' in interface '{}'", method, interface),
        )
    }

    pub fn unknown_property(interface: &str, property: &str) -> Self {
        Self::new(
            Self::UNKNOWN_PROPERTY,
            format!("No such property '{}' in interface '{}'", property, interface),
        )
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_ARGS, message)
    }

    pub fn no_reply() -> Self {
        Self::new(Self::NO_REPLY, "Did not receive a reply")
    }

    pub fn disconnected() -> Self {
        Self::new(Self::DISCONNECTED, "Not connected to the bus")
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(Self::FAILED, message)
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

impl From<CodecError> for BusError {
    fn from(err: CodecError) -> Self {
        Self::invalid_args(err.to_string())
    }
}

impl From<zbus::Error> for BusError {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, message, _) => {
                Self::new(name.to_string(), message.unwrap_or_default())
            }
            zbus::Error::InputOutput(e) => Self::new(Self::DISCONNECTED, e.to_string()),
            other => Self::failed(other.to_string()),
        }
    }
}

/// Crate-level error for the fallible entry points (connecting, config, CLI).
#[derive(Error, Debug)]
pub enum Error {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] zbus::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
