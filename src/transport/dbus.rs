//! Transport over a real D-Bus connection, built on `zbus`.
//!
//! One task drains an outgoing message queue, another reads every incoming
//! message and routes it:
//!
//! ```text
//!  call_with_callback ──> pending_replies[serial] ──┐
//!          │                                        │
//!          └──> send queue ──> send task ──> bus    │
//!                                                   │
//!  bus ──> recv task ──┬─ MethodReturn/Error ───────┘ (callback fires)
//!                      └─ Signal ──> matching signal handlers
//! ```
//!
//! Signals carry the sender's unique name. Rules that name a well-known
//! service are compared against that name's current owner, resolved with
//! `GetNameOwner` and kept up to date from `NameOwnerChanged`.
//!
//! When the incoming stream ends the transport is disconnected: pending
//! calls fail with `Disconnected` and the disconnect handlers run.

use super::convert::{from_body, to_body};
use super::{
    DisconnectHandler, MethodCall, Reply, ReplyCallback, SignalHandler, SignalMessage, SignalRule,
    SignalToken, Transport,
};
use crate::bus::BusAddress;
use crate::error::BusError;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::fdo::{self, DBusProxy};
use zbus::message::{Flags, Type};
use zbus::names::BusName;
use zbus::{MatchRule, Message, MessageStream};

const DBUS_SERVICE: &str = "org.freedesktop.DBus";
const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";

#[derive(Default)]
struct State {
    pending_replies: HashMap<NonZeroU32, ReplyCallback>,
    signal_handlers: HashMap<u64, (SignalRule, SignalHandler)>,
    /// Well-known name to the unique name currently owning it.
    owners: HashMap<String, String>,
    /// Well-known names with live rules, and how many.
    watched: HashMap<String, usize>,
    disconnect_handlers: Vec<DisconnectHandler>,
    next_token: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl State {
    /// Count one more rule for `name`. True for the first one.
    fn watch_name(&mut self, name: &str) -> bool {
        let count = self.watched.entry(name.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Count one rule less for `name`. True when it was the last one.
    fn release_name(&mut self, name: &str) -> bool {
        let Some(count) = self.watched.get_mut(name) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        self.watched.remove(name);
        self.owners.remove(name);
        true
    }

    fn owner_changed(&mut self, name: &str, new_owner: &str) {
        if !self.watched.contains_key(name) {
            return;
        }
        if new_owner.is_empty() {
            self.owners.remove(name);
        } else {
            self.owners.insert(name.to_string(), new_owner.to_string());
        }
    }

    /// An owner learned from `GetNameOwner`. A `NameOwnerChanged` that got
    /// here first is newer and is kept.
    fn owner_resolved(&mut self, name: &str, owner: &str) {
        if self.watched.contains_key(name) && !self.owners.contains_key(name) {
            self.owners.insert(name.to_string(), owner.to_string());
        }
    }

    fn sender_matches(&self, rule: &SignalRule, sender: &str) -> bool {
        if rule.service.is_empty() || rule.service == sender {
            return true;
        }
        is_well_known(&rule.service)
            && self.owners.get(&rule.service).is_some_and(|owner| owner == sender)
    }

    fn matching_handlers(&self, signal: &SignalMessage) -> Vec<SignalHandler> {
        self.signal_handlers
            .values()
            .filter(|(rule, _)| rule.matches(signal) && self.sender_matches(rule, &signal.sender))
            .map(|(_, handler)| handler.clone())
            .collect()
    }
}

/// Names that need owner tracking. Unique names and the bus itself appear
/// as the sender verbatim.
fn is_well_known(name: &str) -> bool {
    !name.is_empty() && !name.starts_with(':') && name != DBUS_SERVICE
}

struct Shared {
    connected: AtomicBool,
    last_error: Mutex<Option<BusError>>,
    state: Mutex<State>,
}

impl Shared {
    fn take_pending(&self, serial: NonZeroU32) -> Option<ReplyCallback> {
        self.state.lock().pending_replies.remove(&serial)
    }

    fn mark_disconnected(&self, error: BusError) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!("Bus connection lost: {}", error);
        *self.last_error.lock() = Some(error);

        let (pending, handlers) = {
            let mut state = self.state.lock();
            state.signal_handlers.clear();
            state.owners.clear();
            state.watched.clear();
            (
                std::mem::take(&mut state.pending_replies),
                std::mem::take(&mut state.disconnect_handlers),
            )
        };
        for (_, callback) in pending {
            callback(Err(BusError::disconnected()));
        }
        for handler in handlers {
            handler();
        }
    }

    async fn send_loop(self: Arc<Self>, connection: zbus::Connection, mut queue: UnboundedReceiver<Message>) {
        while let Some(message) = queue.recv().await {
            if let Err(e) = connection.send(&message).await {
                warn!("Failed to send message: {}", e);
                if let Some(callback) = self.take_pending(message.primary_header().serial_num()) {
                    callback(Err(BusError::from(e)));
                }
            }
        }
    }

    async fn recv_loop(self: Arc<Self>, connection: zbus::Connection) {
        let mut stream = MessageStream::from(&connection);
        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    self.mark_disconnected(BusError::from(e));
                    return;
                }
            };

            match message.message_type() {
                Type::MethodReturn | Type::Error => {
                    let Some(serial) = message.header().reply_serial() else {
                        continue;
                    };
                    if let Some(callback) = self.take_pending(serial) {
                        callback(reply_from_message(&message));
                    }
                }
                Type::Signal => self.dispatch_signal(&message),
                _ => {}
            }
        }
        self.mark_disconnected(BusError::disconnected());
    }

    fn dispatch_signal(&self, message: &Message) {
        let header = message.header();
        let signal = SignalMessage {
            sender: header.sender().map(|s| s.to_string()).unwrap_or_default(),
            path: header.path().map(|p| p.to_string()).unwrap_or_default(),
            interface: header.interface().map(|i| i.to_string()).unwrap_or_default(),
            member: header.member().map(|m| m.to_string()).unwrap_or_default(),
            arguments: Vec::new(),
        };

        if signal.sender == DBUS_SERVICE
            && signal.interface == DBUS_SERVICE
            && signal.member == NAME_OWNER_CHANGED
        {
            if let Ok((name, _old, new)) = message.body().deserialize::<(String, String, String)>() {
                debug!("Owner of {} is now '{}'", name, new);
                self.state.lock().owner_changed(&name, &new);
            }
        }

        let handlers = self.state.lock().matching_handlers(&signal);
        if handlers.is_empty() {
            return;
        }

        let signal = SignalMessage {
            arguments: from_body(message),
            ..signal
        };
        for handler in handlers {
            handler(&signal);
        }
    }

    /// Follow the owner of `name`: match its `NameOwnerChanged`, then ask
    /// for the current owner.
    async fn watch_owner(&self, proxy: &DBusProxy<'_>, name: &str) -> zbus::Result<()> {
        proxy.add_match_rule(name_owner_rule(name)?).await?;
        match proxy.get_name_owner(BusName::try_from(name)?).await {
            Ok(owner) => self.state.lock().owner_resolved(name, owner.as_str()),
            Err(fdo::Error::NameHasNoOwner(_)) => debug!("{} has no owner yet", name),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn add_match(self: Arc<Self>, connection: zbus::Connection, rule: SignalRule, watch_owner: bool) {
        let proxy = match DBusProxy::new(&connection).await {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!("Failed to add match rule ({}): {}", rule, e);
                return;
            }
        };
        if watch_owner {
            if let Err(e) = self.watch_owner(&proxy, &rule.service).await {
                warn!("Failed to resolve owner of {}: {}", rule.service, e);
            }
        }
        if let Err(e) = add_rule(&proxy, &rule).await {
            warn!("Failed to add match rule ({}): {}", rule, e);
        }
    }
}

async fn add_rule(proxy: &DBusProxy<'_>, rule: &SignalRule) -> zbus::Result<()> {
    proxy.add_match_rule(match_rule(rule)?).await?;
    Ok(())
}

async fn remove_rules(connection: &zbus::Connection, rule: &SignalRule, unwatch_owner: bool) -> zbus::Result<()> {
    let proxy = DBusProxy::new(connection).await?;
    proxy.remove_match_rule(match_rule(rule)?).await?;
    if unwatch_owner {
        proxy.remove_match_rule(name_owner_rule(&rule.service)?).await?;
    }
    Ok(())
}

async fn remove_match(connection: zbus::Connection, rule: SignalRule, unwatch_owner: bool) {
    if let Err(e) = remove_rules(&connection, &rule, unwatch_owner).await {
        debug!("Failed to remove match rule ({}): {}", rule, e);
    }
}

fn reply_from_message(message: &Message) -> Reply {
    if message.message_type() == Type::Error {
        let name = message
            .header()
            .error_name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| BusError::FAILED.to_string());
        let text = message.body().deserialize::<String>().unwrap_or_default();
        return Err(BusError::new(name, text));
    }
    Ok(from_body(message))
}

fn build_message(call: &MethodCall, no_reply: bool) -> Result<Message, BusError> {
    let mut builder = Message::method_call(call.path.as_str(), call.method.as_str())?
        .destination(call.service.as_str())?;
    if !call.interface.is_empty() {
        builder = builder.interface(call.interface.as_str())?;
    }
    if no_reply {
        builder = builder.with_flags(Flags::NoReplyExpected)?;
    }

    let message = match to_body(&call.arguments)? {
        Some(body) => builder.build(&body)?,
        None => builder.build(&())?,
    };
    Ok(message)
}

fn match_rule(rule: &SignalRule) -> zbus::Result<MatchRule<'static>> {
    let mut builder = MatchRule::builder().msg_type(Type::Signal);
    if !rule.service.is_empty() {
        builder = builder.sender(rule.service.as_str())?;
    }
    if !rule.path.is_empty() {
        builder = builder.path(rule.path.as_str())?;
    }
    if !rule.interface.is_empty() {
        builder = builder.interface(rule.interface.as_str())?;
    }
    if !rule.member.is_empty() {
        builder = builder.member(rule.member.as_str())?;
    }
    Ok(builder.build().into_owned())
}

fn name_owner_rule(name: &str) -> zbus::Result<MatchRule<'static>> {
    Ok(MatchRule::builder()
        .msg_type(Type::Signal)
        .sender(DBUS_SERVICE)?
        .interface(DBUS_SERVICE)?
        .member(NAME_OWNER_CHANGED)?
        .arg(0, name)?
        .build()
        .into_owned())
}

/// A transport bound to one `zbus` connection.
pub struct ZbusTransport {
    name: String,
    connection: Option<zbus::Connection>,
    call_timeout: Duration,
    runtime: Option<Handle>,
    queue: Option<UnboundedSender<Message>>,
    shared: Arc<Shared>,
}

impl ZbusTransport {
    /// Connect to a bus.
    ///
    /// Never fails: a connect error yields a disconnected transport whose
    /// [`Transport::last_error`] says why.
    pub async fn connect(address: &BusAddress, call_timeout: Duration) -> Self {
        let result = match address {
            BusAddress::Session => zbus::Connection::session().await,
            BusAddress::System => zbus::Connection::system().await,
            BusAddress::Address(addr) => match zbus::connection::Builder::address(addr.as_str()) {
                Ok(builder) => builder.build().await,
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(connection) => Self::from_connection(address.to_string(), connection, call_timeout),
            Err(e) => {
                warn!("Failed to connect to {} bus: {}", address, e);
                Self::disconnected(address.to_string(), BusError::from(e))
            }
        }
    }

    /// Wrap an established connection. Must run inside a Tokio runtime.
    pub fn from_connection(name: String, connection: zbus::Connection, call_timeout: Duration) -> Self {
        let Ok(runtime) = Handle::try_current() else {
            return Self::disconnected(name, BusError::failed("No async runtime to drive the connection"));
        };

        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            last_error: Mutex::new(None),
            state: Mutex::new(State::default()),
        });
        let (queue, receiver) = mpsc::unbounded_channel();
        {
            let send = runtime.spawn(shared.clone().send_loop(connection.clone(), receiver));
            let recv = runtime.spawn(shared.clone().recv_loop(connection.clone()));
            shared.state.lock().tasks.extend([send, recv]);
        }

        info!(
            "Connected to {} bus as {}",
            name,
            connection.unique_name().map(|n| n.to_string()).unwrap_or_default()
        );

        Self {
            name,
            connection: Some(connection),
            call_timeout,
            runtime: Some(runtime),
            queue: Some(queue),
            shared,
        }
    }

    fn disconnected(name: String, error: BusError) -> Self {
        Self {
            name,
            connection: None,
            call_timeout: Duration::ZERO,
            runtime: None,
            queue: None,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                last_error: Mutex::new(Some(error)),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// The underlying `zbus` connection, if connected.
    pub fn connection(&self) -> Option<&zbus::Connection> {
        self.connection.as_ref()
    }

    fn enqueue(&self, message: Message) -> bool {
        match &self.queue {
            Some(queue) if self.is_connected() => queue.send(message).is_ok(),
            _ => false,
        }
    }

    fn arm_timeout(&self, serial: NonZeroU32) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        let shared = self.shared.clone();
        let timeout = self.call_timeout;
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(callback) = shared.take_pending(serial) {
                debug!("Call {} timed out after {:?}", serial, timeout);
                callback(Err(BusError::no_reply()));
            }
        });
    }
}

impl Drop for ZbusTransport {
    fn drop(&mut self) {
        for task in std::mem::take(&mut self.shared.state.lock().tasks) {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl Transport for ZbusTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn last_error(&self) -> Option<BusError> {
        self.shared.last_error.lock().clone()
    }

    fn call_with_callback(&self, call: MethodCall, callback: ReplyCallback) {
        if !self.is_connected() {
            callback(Err(BusError::disconnected()));
            return;
        }

        let message = match build_message(&call, false) {
            Ok(message) => message,
            Err(e) => {
                callback(Err(e));
                return;
            }
        };

        let serial = message.primary_header().serial_num();
        self.shared.state.lock().pending_replies.insert(serial, callback);
        if !self.enqueue(message) {
            if let Some(callback) = self.shared.take_pending(serial) {
                callback(Err(BusError::disconnected()));
            }
            return;
        }
        self.arm_timeout(serial);
    }

    fn send(&self, call: MethodCall) -> bool {
        match build_message(&call, true) {
            Ok(message) => self.enqueue(message),
            Err(e) => {
                warn!("Cannot send ({}): {}", call, e);
                false
            }
        }
    }

    fn connect_signal(&self, rule: SignalRule, handler: SignalHandler) -> Result<SignalToken, BusError> {
        let (Some(connection), Some(runtime)) = (&self.connection, &self.runtime) else {
            return Err(BusError::disconnected());
        };
        if !self.is_connected() {
            return Err(BusError::disconnected());
        }
        if let Err(e) = match_rule(&rule) {
            return Err(BusError::invalid_args(format!("Bad match rule ({}): {}", rule, e)));
        }

        let (token, watch_owner) = {
            let mut state = self.shared.state.lock();
            state.next_token += 1;
            let token = state.next_token;
            let watch_owner = is_well_known(&rule.service) && state.watch_name(&rule.service);
            state.signal_handlers.insert(token, (rule.clone(), handler));
            (token, watch_owner)
        };

        runtime.spawn(
            self.shared
                .clone()
                .add_match(connection.clone(), rule, watch_owner),
        );
        Ok(SignalToken(token))
    }

    fn disconnect_signal(&self, token: SignalToken) {
        let (rule, unwatch_owner) = {
            let mut state = self.shared.state.lock();
            let Some((rule, _)) = state.signal_handlers.remove(&token.0) else {
                return;
            };
            let unwatch_owner = is_well_known(&rule.service) && state.release_name(&rule.service);
            (rule, unwatch_owner)
        };

        if let (Some(connection), Some(runtime)) = (&self.connection, &self.runtime) {
            if self.is_connected() {
                runtime.spawn(remove_match(connection.clone(), rule, unwatch_owner));
            }
        }
    }

    fn on_disconnected(&self, handler: DisconnectHandler) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.shared.state.lock().disconnect_handlers.push(handler);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_match_rule_skips_wildcards() {
        let rule = SignalRule::new(
            "org.example.svc",
            "/org/example/svc",
            "org.freedesktop.DBus.Properties",
            "PropertiesChanged",
        );
        let text = match_rule(&rule).unwrap().to_string();
        assert!(text.contains("type='signal'"));
        assert!(text.contains("sender='org.example.svc'"));
        assert!(text.contains("path='/org/example/svc'"));
        assert!(text.contains("interface='org.freedesktop.DBus.Properties'"));
        assert!(text.contains("member='PropertiesChanged'"));

        let text = match_rule(&SignalRule::new("", "", "org.example.svc", ""))
            .unwrap()
            .to_string();
        assert!(text.contains("interface='org.example.svc'"));
        assert!(!text.contains("sender="));
        assert!(!text.contains("path="));

        assert!(match_rule(&SignalRule::new("", "it's not a path", "", "")).is_err());
    }

    #[test]
    fn test_name_owner_rule() {
        let text = name_owner_rule("org.example.svc").unwrap().to_string();
        assert!(text.contains("member='NameOwnerChanged'"));
        assert!(text.contains("arg0='org.example.svc'"));
    }

    #[test]
    fn test_build_message() {
        let call = MethodCall::new("org.example.svc", "/org/example/svc", "org.example.svc", "Ping");
        let message = build_message(&call, false).unwrap();
        assert_eq!(message.message_type(), Type::MethodCall);
        assert_eq!(
            message.header().member().map(|m| m.to_string()),
            Some("Ping".to_string())
        );

        let bad = MethodCall::new("org.example.svc", "not a path", "org.example.svc", "Ping");
        assert!(build_message(&bad, false).is_err());
    }

    fn counting_handler(count: &Arc<AtomicUsize>) -> SignalHandler {
        let count = count.clone();
        Arc::new(move |_: &SignalMessage| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn properties_changed_from(sender: &str) -> SignalMessage {
        SignalMessage {
            sender: sender.into(),
            path: "/p".into(),
            interface: "org.freedesktop.DBus.Properties".into(),
            member: "PropertiesChanged".into(),
            arguments: Vec::new(),
        }
    }

    fn register(state: &mut State, token: u64, rule: SignalRule, handler: SignalHandler) {
        if is_well_known(&rule.service) {
            state.watch_name(&rule.service);
        }
        state.signal_handlers.insert(token, (rule, handler));
    }

    fn deliver(state: &State, signal: &SignalMessage) {
        for handler in state.matching_handlers(signal) {
            handler(signal);
        }
    }

    #[test]
    fn test_services_sharing_a_path_are_told_apart() {
        let mut state = State::default();
        let (to_a, to_b) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let rule = |service: &str| {
            SignalRule::new(service, "/p", "org.freedesktop.DBus.Properties", "PropertiesChanged")
        };
        register(&mut state, 1, rule("org.example.a"), counting_handler(&to_a));
        register(&mut state, 2, rule("org.example.b"), counting_handler(&to_b));
        state.owner_resolved("org.example.a", ":1.9");
        state.owner_resolved("org.example.b", ":1.10");

        deliver(&state, &properties_changed_from(":1.9"));
        assert_eq!(to_a.load(Ordering::SeqCst), 1);
        assert_eq!(to_b.load(Ordering::SeqCst), 0);

        deliver(&state, &properties_changed_from(":1.10"));
        assert_eq!(to_a.load(Ordering::SeqCst), 1);
        assert_eq!(to_b.load(Ordering::SeqCst), 1);

        deliver(&state, &properties_changed_from(":1.42"));
        assert_eq!(to_a.load(Ordering::SeqCst), 1);
        assert_eq!(to_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_owner_tracking() {
        let mut state = State::default();
        let rule = SignalRule::new("org.example.svc", "", "", "");
        assert!(!state.sender_matches(&rule, ":1.7"));

        assert!(state.watch_name("org.example.svc"));
        assert!(!state.watch_name("org.example.svc"));

        // Without an owner nothing matches
        assert!(!state.sender_matches(&rule, ":1.7"));

        state.owner_changed("org.example.svc", ":1.7");
        state.owner_resolved("org.example.svc", ":1.3");
        assert!(state.sender_matches(&rule, ":1.7"));
        assert!(!state.sender_matches(&rule, ":1.3"));

        state.owner_changed("org.example.svc", ":1.8");
        assert!(!state.sender_matches(&rule, ":1.7"));
        assert!(state.sender_matches(&rule, ":1.8"));

        state.owner_changed("org.example.svc", "");
        assert!(!state.sender_matches(&rule, ":1.8"));

        // Names nobody follows are not recorded
        state.owner_changed("org.example.other", ":1.9");
        assert!(!state.owners.contains_key("org.example.other"));

        state.owner_changed("org.example.svc", ":1.8");
        assert!(!state.release_name("org.example.svc"));
        assert!(state.release_name("org.example.svc"));
        assert!(!state.sender_matches(&rule, ":1.8"));
    }

    #[test]
    fn test_unique_and_bus_senders_compare_directly() {
        let state = State::default();
        assert!(state.sender_matches(&SignalRule::new(":1.7", "", "", ""), ":1.7"));
        assert!(!state.sender_matches(&SignalRule::new(":1.8", "", "", ""), ":1.7"));
        assert!(state.sender_matches(&SignalRule::new("", "", "", ""), ":1.7"));
        assert!(state.sender_matches(&SignalRule::new(DBUS_SERVICE, "", "", ""), DBUS_SERVICE));
        assert!(!is_well_known(DBUS_SERVICE));
        assert!(!is_well_known(":1.7"));
        assert!(is_well_known("org.example.svc"));
    }

    #[tokio::test]
    async fn test_unreachable_address_gives_disconnected_transport() {
        let address = BusAddress::Address("unix:path=/nonexistent/busline-test-socket".into());
        let transport = ZbusTransport::connect(&address, Duration::from_secs(1)).await;
        assert!(!transport.is_connected());
        assert!(transport.last_error().is_some());
        assert!(!transport.send(MethodCall::new("a.b", "/", "a.b", "M")));
        assert!(transport.call(MethodCall::new("a.b", "/", "a.b", "M")).await.is_err());
    }
}
