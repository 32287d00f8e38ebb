//! Busline: a client-side D-Bus runtime.
//!
//! - [`Connection`]: one shared connection per bus, with non-blocking calls
//!   returning [`PendingCall`] handles.
//! - [`PropertyChanges`]: a single `PropertiesChanged` subscription per remote
//!   object, fanned out to any number of property subscribers.
//! - [`codec`]: conversion between Rust values, the normalized [`Value`] and
//!   the D-Bus type system.
//! - [`transport`]: the seam to the wire, with a `zbus` implementation and an
//!   in-process [`MemoryBus`] for tests.

pub mod bus;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod object;
pub mod pending;
pub mod properties;
pub mod transport;

// Re-export commonly used types for convenience
pub use bus::{default_bus, session_bus, system_bus, BusAddress};
pub use codec::{demarshall, marshall, TypedArg, Value, WireValue};
pub use config::Config;
pub use connection::{Connection, ConnectionEvent, PROPERTIES_INTERFACE};
pub use context::Context;
pub use error::{BusError, Error, Result};
pub use object::{Interface, Object};
pub use pending::PendingCall;
pub use properties::PropertyChanges;
pub use transport::{MemoryBus, PropertyNotify, Transport};
