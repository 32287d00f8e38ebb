//! In-process bus.
//!
//! [`MemoryBus`] plays the bus daemon and the remote services at once: it
//! routes calls to registered objects, implements
//! `org.freedesktop.DBus.Properties` for them and fans signals out to every
//! connected [`MemoryTransport`].
//!
//! Nothing is delivered until [`MemoryBus::dispatch`] runs. Calls, signals and
//! disconnect notifications queue up in FIFO order, which gives tests full
//! control over interleavings (a change signal overtaking a re-fetch, a
//! disconnect arriving mid-flight, ...). Blocking calls bypass the queue.

use super::{
    DisconnectHandler, MethodCall, Reply, ReplyCallback, SignalHandler, SignalMessage, SignalRule,
    SignalToken, Transport,
};
use crate::codec::{IntoArguments, Marshall, WireValue};
use crate::connection::PROPERTIES_INTERFACE;
use crate::error::BusError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Server-side method implementation.
pub type MethodHandler = Arc<dyn Fn(&[WireValue]) -> Reply + Send + Sync>;

/// How a property update is announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyNotify {
    /// `PropertiesChanged` carrying the new value.
    Changed,
    /// `PropertiesChanged` listing the name as invalidated, without value.
    Invalidated,
    /// No signal.
    Silent,
}

type CallKey = (String, String, String, String);

#[derive(Default)]
struct ObjectState {
    methods: HashMap<(String, String), MethodHandler>,
    properties: HashMap<(String, String), WireValue>,
}

enum Delivery {
    Call {
        call: MethodCall,
        callback: Option<ReplyCallback>,
    },
    Reply {
        callback: ReplyCallback,
        reply: Reply,
    },
    Signal(SignalMessage),
    Disconnect(Weak<MemoryTransport>),
}

#[derive(Default)]
struct BusState {
    services: HashMap<String, HashMap<String, ObjectState>>,
    queue: VecDeque<Delivery>,
    transports: Vec<Weak<MemoryTransport>>,
    call_counts: HashMap<CallKey, usize>,
}

#[derive(Default)]
struct BusInner {
    state: Mutex<BusState>,
}

impl BusInner {
    fn enqueue(&self, delivery: Delivery) {
        self.state.lock().queue.push_back(delivery);
    }

    fn emit(&self, service: &str, path: &str, interface: &str, member: &str, arguments: Vec<WireValue>) {
        self.enqueue(Delivery::Signal(SignalMessage {
            sender: service.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            arguments,
        }));
    }

    fn emit_properties_changed(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
        value: &WireValue,
        notify: PropertyNotify,
    ) {
        let (changed, invalidated) = match notify {
            PropertyNotify::Silent => return,
            PropertyNotify::Changed => (
                vec![(
                    WireValue::String(name.to_string()),
                    WireValue::Variant(Box::new(value.clone())),
                )],
                vec![],
            ),
            PropertyNotify::Invalidated => (vec![], vec![WireValue::String(name.to_string())]),
        };

        self.emit(
            service,
            path,
            PROPERTIES_INTERFACE,
            "PropertiesChanged",
            vec![
                WireValue::String(interface.to_string()),
                WireValue::Dict {
                    key: "s".into(),
                    value: "v".into(),
                    entries: changed,
                },
                WireValue::Array {
                    element: "s".into(),
                    items: invalidated,
                },
            ],
        );
    }

    /// Compute the reply to `call`. Method handlers run, and change signals
    /// are queued, without the bus lock held.
    fn handle_call(&self, call: &MethodCall) -> Reply {
        enum Route {
            Method(MethodHandler),
            Answered(Reply),
        }

        let mut change = None;
        let route = {
            let mut state = self.state.lock();
            let object = state
                .services
                .get_mut(&call.service)
                .ok_or_else(|| BusError::service_unknown(&call.service))?
                .get_mut(&call.path)
                .ok_or_else(|| BusError::unknown_object(&call.path))?;

            if call.interface == PROPERTIES_INTERFACE {
                Route::Answered(Self::handle_properties(object, call, &mut change))
            } else {
                object
                    .methods
                    .get(&(call.interface.clone(), call.method.clone()))
                    .cloned()
                    .map(Route::Method)
                    .ok_or_else(|| BusError::unknown_method(&call.interface, &call.method))?
            }
        };

        if let Some((interface, name, value)) = change {
            self.emit_properties_changed(
                &call.service,
                &call.path,
                &interface,
                &name,
                &value,
                PropertyNotify::Changed,
            );
        }

        match route {
            Route::Method(handler) => handler(&call.arguments),
            Route::Answered(reply) => reply,
        }
    }

    fn handle_properties(
        object: &mut ObjectState,
        call: &MethodCall,
        change: &mut Option<(String, String, WireValue)>,
    ) -> Reply {
        let string_arg = |index: usize| {
            call.arguments
                .get(index)
                .and_then(WireValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| BusError::invalid_args(format!("Bad arguments for {}", call.method)))
        };

        match call.method.as_str() {
            "Get" => {
                let key = (string_arg(0)?, string_arg(1)?);
                object
                    .properties
                    .get(&key)
                    .map(|value| vec![WireValue::Variant(Box::new(value.clone()))])
                    .ok_or_else(|| BusError::unknown_property(&key.0, &key.1))
            }
            "GetAll" => {
                let interface = string_arg(0)?;
                let mut entries: Vec<_> = object
                    .properties
                    .iter()
                    .filter(|((iface, _), _)| *iface == interface)
                    .map(|((_, name), value)| {
                        (
                            WireValue::String(name.clone()),
                            WireValue::Variant(Box::new(value.clone())),
                        )
                    })
                    .collect();
                entries.sort_by(|a, b| a.0.as_str().cmp(&b.0.as_str()));
                Ok(vec![WireValue::Dict {
                    key: "s".into(),
                    value: "v".into(),
                    entries,
                }])
            }
            "Set" => {
                let key = (string_arg(0)?, string_arg(1)?);
                let value = call
                    .arguments
                    .get(2)
                    .cloned()
                    .ok_or_else(|| BusError::invalid_args("Set needs a value"))?
                    .into_inner_variant();
                let slot = object
                    .properties
                    .get_mut(&key)
                    .ok_or_else(|| BusError::unknown_property(&key.0, &key.1))?;
                *slot = value.clone();
                *change = Some((key.0, key.1, value));
                Ok(Vec::new())
            }
            _ => Err(BusError::unknown_method(&call.interface, &call.method)),
        }
    }

    fn live_transports(&self) -> Vec<Arc<MemoryTransport>> {
        let mut state = self.state.lock();
        state.transports.retain(|t| t.strong_count() > 0);
        state.transports.iter().filter_map(Weak::upgrade).collect()
    }

    fn count_call(&self, call: &MethodCall) {
        let key = (
            call.service.clone(),
            call.path.clone(),
            call.interface.clone(),
            call.method.clone(),
        );
        *self.state.lock().call_counts.entry(key).or_default() += 1;
    }
}

/// The in-process bus. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection to this bus.
    pub fn connect(&self) -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport {
            bus: self.inner.clone(),
            connected: AtomicBool::new(true),
            reject_signals: AtomicBool::new(false),
            last_error: Mutex::new(None),
            next_token: AtomicU64::new(1),
            handlers: Mutex::new(HashMap::new()),
            disconnect_handlers: Mutex::new(Vec::new()),
        });
        self.inner.state.lock().transports.push(Arc::downgrade(&transport));
        transport
    }

    /// Register an object, creating the service name if needed.
    pub fn register_object(&self, service: &str, path: &str) -> MemoryObject {
        self.inner
            .state
            .lock()
            .services
            .entry(service.to_string())
            .or_default()
            .entry(path.to_string())
            .or_default();

        MemoryObject {
            bus: self.inner.clone(),
            service: service.to_string(),
            path: path.to_string(),
        }
    }

    /// Drop a service and all its objects. Later calls fail with ServiceUnknown.
    pub fn unregister_service(&self, service: &str) {
        self.inner.state.lock().services.remove(service);
    }

    /// Deliver everything queued, including what gets queued while delivering.
    /// Returns the number of deliveries made.
    pub fn dispatch(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.inner.state.lock().queue.pop_front();
            let Some(delivery) = next else {
                return delivered;
            };
            delivered += 1;
            self.deliver(delivery);
        }
    }

    /// Number of queued deliveries.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// How many times a method was called, through any path.
    pub fn call_count(&self, service: &str, path: &str, interface: &str, method: &str) -> usize {
        let key = (
            service.to_string(),
            path.to_string(),
            interface.to_string(),
            method.to_string(),
        );
        self.inner.state.lock().call_counts.get(&key).copied().unwrap_or(0)
    }

    /// Number of live signal registrations with exactly this rule, across all
    /// connections.
    pub fn match_count(&self, service: &str, path: &str, interface: &str, member: &str) -> usize {
        let rule = SignalRule::new(service, path, interface, member);
        self.inner
            .live_transports()
            .iter()
            .map(|t| t.handlers.lock().values().filter(|(r, _)| *r == rule).count())
            .sum()
    }

    fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::Call { call, callback } => {
                let reply = self.inner.handle_call(&call);
                trace!("Memory bus reply for ({}): {:?}", call, reply.as_ref().map(Vec::len));
                if let Some(callback) = callback {
                    callback(reply);
                }
            }
            Delivery::Reply { callback, reply } => callback(reply),
            Delivery::Signal(signal) => {
                for transport in self.inner.live_transports() {
                    transport.deliver_signal(&signal);
                }
            }
            Delivery::Disconnect(transport) => {
                if let Some(transport) = transport.upgrade() {
                    let handlers = std::mem::take(&mut *transport.disconnect_handlers.lock());
                    for handler in handlers {
                        handler();
                    }
                }
            }
        }
    }
}

/// A registered object on a [`MemoryBus`].
#[derive(Clone)]
pub struct MemoryObject {
    bus: Arc<BusInner>,
    service: String,
    path: String,
}

impl MemoryObject {
    fn with_object<R>(&self, f: impl FnOnce(&mut ObjectState) -> R) -> Option<R> {
        let mut state = self.bus.state.lock();
        state
            .services
            .get_mut(&self.service)
            .and_then(|objects| objects.get_mut(&self.path))
            .map(f)
    }

    /// Implement `interface.name`.
    pub fn method(
        &self,
        interface: &str,
        name: &str,
        handler: impl Fn(&[WireValue]) -> Reply + Send + Sync + 'static,
    ) -> &Self {
        let handler: MethodHandler = Arc::new(handler);
        self.with_object(|object| {
            object
                .methods
                .insert((interface.to_string(), name.to_string()), handler)
        });
        self
    }

    /// Declare a property with an initial value, without notification.
    pub fn property(&self, interface: &str, name: &str, value: impl Marshall) -> &Self {
        self.set_property(interface, name, value, PropertyNotify::Silent);
        self
    }

    /// Update a property from the service side.
    pub fn set_property(&self, interface: &str, name: &str, value: impl Marshall, notify: PropertyNotify) {
        let value = value.marshall();
        self.with_object(|object| {
            object
                .properties
                .insert((interface.to_string(), name.to_string()), value.clone())
        });
        self.bus
            .emit_properties_changed(&self.service, &self.path, interface, name, &value, notify);
    }

    /// Current value of a property, as stored.
    pub fn property_value(&self, interface: &str, name: &str) -> Option<WireValue> {
        self.with_object(|object| {
            object
                .properties
                .get(&(interface.to_string(), name.to_string()))
                .cloned()
        })
        .flatten()
    }

    /// Queue a signal from this object.
    pub fn emit_signal(&self, interface: &str, member: &str, arguments: impl IntoArguments) {
        self.bus
            .emit(&self.service, &self.path, interface, member, arguments.into_arguments());
    }

    /// Queue a raw `PropertiesChanged` signal.
    pub fn emit_properties_changed(
        &self,
        interface: &str,
        changed: Vec<(&str, WireValue)>,
        invalidated: Vec<&str>,
    ) {
        let changed = changed
            .into_iter()
            .map(|(name, value)| (WireValue::String(name.to_string()), WireValue::Variant(Box::new(value))))
            .collect();
        let invalidated = invalidated
            .into_iter()
            .map(|name| WireValue::String(name.to_string()))
            .collect();

        self.bus.emit(
            &self.service,
            &self.path,
            PROPERTIES_INTERFACE,
            "PropertiesChanged",
            vec![
                WireValue::String(interface.to_string()),
                WireValue::Dict {
                    key: "s".into(),
                    value: "v".into(),
                    entries: changed,
                },
                WireValue::Array {
                    element: "s".into(),
                    items: invalidated,
                },
            ],
        );
    }
}

/// A client connection to a [`MemoryBus`].
pub struct MemoryTransport {
    bus: Arc<BusInner>,
    connected: AtomicBool,
    reject_signals: AtomicBool,
    last_error: Mutex<Option<BusError>>,
    next_token: AtomicU64,
    handlers: Mutex<HashMap<u64, (SignalRule, SignalHandler)>>,
    disconnect_handlers: Mutex<Vec<DisconnectHandler>>,
}

impl MemoryTransport {
    /// Drop the connection. Later calls fail; the disconnect notification is
    /// queued behind whatever is already pending.
    pub fn disconnect(self: &Arc<Self>) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("Memory transport disconnected");
        *self.last_error.lock() = Some(BusError::disconnected());
        self.handlers.lock().clear();
        self.bus.enqueue(Delivery::Disconnect(Arc::downgrade(self)));
    }

    /// Make signal registrations fail, as a bus refusing match rules would.
    pub fn reject_signal_subscriptions(&self, reject: bool) {
        self.reject_signals.store(reject, Ordering::SeqCst);
    }

    fn deliver_signal(&self, signal: &SignalMessage) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let matching: Vec<SignalHandler> = self
            .handlers
            .lock()
            .values()
            .filter(|(rule, _)| {
                rule.matches(signal) && (rule.service.is_empty() || rule.service == signal.sender)
            })
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in matching {
            handler(signal);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn last_error(&self) -> Option<BusError> {
        self.last_error.lock().clone()
    }

    fn call_with_callback(&self, call: MethodCall, callback: ReplyCallback) {
        if !self.is_connected() {
            self.bus.enqueue(Delivery::Reply {
                callback,
                reply: Err(BusError::disconnected()),
            });
            return;
        }
        self.bus.count_call(&call);
        self.bus.enqueue(Delivery::Call {
            call,
            callback: Some(callback),
        });
    }

    async fn call(&self, call: MethodCall) -> Reply {
        if !self.is_connected() {
            return Err(BusError::disconnected());
        }
        self.bus.count_call(&call);
        self.bus.handle_call(&call)
    }

    fn send(&self, call: MethodCall) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.bus.count_call(&call);
        self.bus.enqueue(Delivery::Call { call, callback: None });
        true
    }

    fn connect_signal(&self, rule: SignalRule, handler: SignalHandler) -> Result<SignalToken, BusError> {
        if !self.is_connected() {
            return Err(BusError::disconnected());
        }
        if self.reject_signals.load(Ordering::SeqCst) {
            return Err(BusError::new(BusError::ACCESS_DENIED, format!("Match rule rejected: {}", rule)));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().insert(token, (rule, handler));
        Ok(SignalToken(token))
    }

    fn disconnect_signal(&self, token: SignalToken) {
        self.handlers.lock().remove(&token.0);
    }

    fn on_disconnected(&self, handler: DisconnectHandler) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.disconnect_handlers.lock().push(handler);
        true
    }
}
