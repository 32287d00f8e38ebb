//! The seam between the runtime and the IPC library.
//!
//! ```text
//! ┌────────────┐   MethodCall    ┌───────────────────┐
//! │ Connection │ ──────────────> │ dyn Transport     │
//! │            │ <── Reply ───── │  ├─ ZbusTransport │ ── real bus
//! │            │ <── Signal ──── │  └─ MemoryBus     │ ── in-process
//! └────────────┘                 └───────────────────┘
//! ```
//!
//! A transport moves already-marshalled [`WireValue`]s. Framing, auth and the
//! binary encoding are its business; everything above it (pending calls,
//! property caching, value normalization) is ours.

mod convert;
pub mod dbus;
pub mod memory;

use crate::codec::{IntoArguments, WireValue};
use crate::error::BusError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub use self::dbus::ZbusTransport;
pub use self::memory::{MemoryBus, MemoryObject, MemoryTransport, PropertyNotify};

/// Outcome of a method call: the reply arguments or the error reply.
pub type Reply = Result<Vec<WireValue>, BusError>;

/// Continuation invoked exactly once with a call's outcome.
pub type ReplyCallback = Box<dyn FnOnce(Reply) + Send>;

/// Handler for signals matching a [`SignalRule`].
pub type SignalHandler = Arc<dyn Fn(&SignalMessage) + Send + Sync>;

/// Handler for the transport's local disconnect notification.
pub type DisconnectHandler = Box<dyn Fn() + Send + Sync>;

/// An outgoing method call.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub method: String,
    pub arguments: Vec<WireValue>,
}

impl MethodCall {
    pub fn new(
        service: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
            interface: interface.into(),
            method: method.into(),
            arguments: Vec::new(),
        }
    }

    pub fn with_arguments(mut self, arguments: impl IntoArguments) -> Self {
        self.arguments = arguments.into_arguments();
        self
    }
}

/// `service path interface.method`, the form used in log lines.
impl fmt::Display for MethodCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}.{}", self.service, self.path, self.interface, self.method)
    }
}

/// Which signals a handler wants. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SignalRule {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub member: String,
}

impl SignalRule {
    pub fn new(
        service: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
        }
    }

    /// Match on path, interface and member.
    ///
    /// The sender is not compared here: signals carry the unique name of the
    /// connection that owns a well-known name, so each transport matches
    /// senders its own way.
    pub fn matches(&self, signal: &SignalMessage) -> bool {
        fn field(rule: &str, actual: &str) -> bool {
            rule.is_empty() || rule == actual
        }

        field(&self.path, &signal.path)
            && field(&self.interface, &signal.interface)
            && field(&self.member, &signal.member)
    }
}

impl fmt::Display for SignalRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}.{}", self.service, self.path, self.interface, self.member)
    }
}

/// An incoming signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub arguments: Vec<WireValue>,
}

/// Handle for a signal registration, used to undo it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalToken(pub u64);

/// The IPC library as the runtime sees it.
///
/// Implementations must be usable from any thread and must never invoke a
/// callback while holding an internal lock the callback could re-enter.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name for log lines (bus address or `memory`).
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// The error that caused the last connect/disconnect, if any.
    fn last_error(&self) -> Option<BusError>;

    /// Submit a call and return immediately. `callback` receives exactly one
    /// outcome, possibly from another thread.
    fn call_with_callback(&self, call: MethodCall, callback: ReplyCallback);

    /// Submit a call and wait for its outcome.
    async fn call(&self, call: MethodCall) -> Reply {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.call_with_callback(
            call,
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        );
        rx.await.unwrap_or_else(|_| Err(BusError::no_reply()))
    }

    /// Submit a call that expects no reply. Returns whether it was accepted
    /// for sending.
    fn send(&self, call: MethodCall) -> bool;

    fn connect_signal(&self, rule: SignalRule, handler: SignalHandler) -> Result<SignalToken, BusError>;

    fn disconnect_signal(&self, token: SignalToken);

    /// Register for the local disconnect notification. Returns `false` if the
    /// transport is not connected (the handler is dropped).
    fn on_disconnected(&self, handler: DisconnectHandler) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(path: &str, interface: &str, member: &str) -> SignalMessage {
        SignalMessage {
            sender: ":1.5".into(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            arguments: Vec::new(),
        }
    }

    #[test]
    fn test_method_call_display() {
        let call = MethodCall::new("org.example.svc", "/org/example/svc", "org.example.svc", "Ping");
        assert_eq!(call.to_string(), "org.example.svc /org/example/svc org.example.svc.Ping");
        assert!(call.arguments.is_empty());

        let call = call.with_arguments((1i32, "two"));
        assert_eq!(call.arguments.len(), 2);
    }

    #[test]
    fn test_rule_matching() {
        let rule = SignalRule::new(
            "org.example.svc",
            "/org/example/svc",
            "org.freedesktop.DBus.Properties",
            "PropertiesChanged",
        );
        assert!(rule.matches(&signal(
            "/org/example/svc",
            "org.freedesktop.DBus.Properties",
            "PropertiesChanged"
        )));
        assert!(!rule.matches(&signal("/other", "org.freedesktop.DBus.Properties", "PropertiesChanged")));

        let wildcard = SignalRule::new("", "", "org.example.svc", "");
        assert!(wildcard.matches(&signal("/any", "org.example.svc", "Anything")));
        assert!(!wildcard.matches(&signal("/any", "org.other", "Anything")));
    }
}
