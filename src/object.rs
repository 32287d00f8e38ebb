//! Object and interface facade.
//!
//! Thin bindings of `(connection, service, path)` and
//! `(connection, service, path, interface)` so consumers do not repeat the
//! addressing on every call. They hold no state of their own.

use crate::codec::{
    demarshall, AsVariant, CodecError, Demarshall, IntoArguments, Marshall, TypedArg, Value, WireValue,
};
use crate::connection::{Connection, PROPERTIES_INTERFACE};
use crate::context::Context;
use crate::pending::PendingCall;
use crate::transport::Reply;
use std::collections::BTreeMap;
use tracing::warn;

/// A remote object: a service and an object path on one connection.
#[derive(Clone, Debug)]
pub struct Object {
    connection: Connection,
    service: String,
    path: String,
}

impl Object {
    pub fn new(connection: &Connection, service: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            connection: connection.clone(),
            service: service.into(),
            path: path.into(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// One of this object's interfaces.
    pub fn interface(&self, interface: impl Into<String>) -> Interface {
        Interface {
            object: self.clone(),
            interface: interface.into(),
        }
    }

    pub fn call(&self, context: &Context, interface: &str, method: &str, arguments: impl IntoArguments) -> PendingCall {
        self.connection
            .call(context, &self.service, &self.path, interface, method, arguments)
    }

    pub async fn blocking_call(&self, interface: &str, method: &str, arguments: impl IntoArguments) -> Reply {
        self.connection
            .blocking_call(&self.service, &self.path, interface, method, arguments)
            .await
    }

    /// Every property of `interface`, normalized. Empty if the call fails.
    pub async fn get_all_properties(&self, interface: &str) -> BTreeMap<String, Value> {
        let reply = self.blocking_call(PROPERTIES_INTERFACE, "GetAll", (interface,)).await;
        match reply {
            Ok(arguments) => match arguments.first().map(demarshall) {
                Some(Value::Map(map)) => map,
                _ => BTreeMap::new(),
            },
            Err(e) => {
                warn!("Failed to get properties ({} {} {}): {}", self.service, self.path, interface, e);
                BTreeMap::new()
            }
        }
    }
}

/// One interface of a remote object.
#[derive(Clone, Debug)]
pub struct Interface {
    object: Object,
    interface: String,
}

impl Interface {
    pub fn new(
        connection: &Connection,
        service: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Object::new(connection, service, path).interface(interface)
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn name(&self) -> &str {
        &self.interface
    }

    pub fn call(&self, context: &Context, method: &str, arguments: impl IntoArguments) -> PendingCall {
        self.object.call(context, &self.interface, method, arguments)
    }

    pub fn typed_call(&self, context: &Context, method: &str, arguments: &[TypedArg]) -> Result<PendingCall, CodecError> {
        self.object.connection.typed_call(
            context,
            &self.object.service,
            &self.object.path,
            &self.interface,
            method,
            arguments,
        )
    }

    pub async fn blocking_call(&self, method: &str, arguments: impl IntoArguments) -> Reply {
        self.object.blocking_call(&self.interface, method, arguments).await
    }

    pub fn send(&self, method: &str, arguments: impl IntoArguments) -> bool {
        self.object
            .connection
            .send(&self.object.service, &self.object.path, &self.interface, method, arguments)
    }

    /// See [`Connection::subscribe_to_property`].
    pub fn subscribe_to_property<T, F>(&self, context: &Context, property: &str, on_changed: F)
    where
        T: Demarshall + Default + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.object
            .connection
            .subscribe_to_property(
                context,
                &self.object.service,
                &self.object.path,
                &self.interface,
                property,
                on_changed,
            );
    }

    pub fn connect_to_signal(
        &self,
        signal: &str,
        context: &Context,
        handler: impl Fn(&[Value]) + Send + Sync + 'static,
    ) -> bool {
        self.object.connection.connect_to_signal(
            &self.object.service,
            &self.object.path,
            &self.interface,
            signal,
            context,
            handler,
        )
    }

    /// Current value of a property, normalized. [`Value::Invalid`] if it
    /// cannot be read.
    pub async fn get_property(&self, property: &str) -> Value {
        self.get_raw_property(property)
            .await
            .map(|value| demarshall(&value))
            .unwrap_or_default()
    }

    /// Current value of a property as carried on the bus.
    pub async fn get_raw_property(&self, property: &str) -> Option<WireValue> {
        self.object
            .connection
            .get_property(&self.object.service, &self.object.path, &self.interface, property)
            .await
    }

    pub async fn get_all_properties(&self) -> BTreeMap<String, Value> {
        self.object.get_all_properties(&self.interface).await
    }

    /// Write a property without waiting for the outcome. Returns whether the
    /// request was sent.
    pub fn set_property(&self, property: &str, value: impl Marshall) -> bool {
        self.object.connection.send(
            &self.object.service,
            &self.object.path,
            PROPERTIES_INTERFACE,
            "Set",
            (self.interface.as_str(), property, AsVariant(value)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBus;

    const SVC: &str = "org.example.svc";
    const PATH: &str = "/org/example/svc";

    fn setup() -> (MemoryBus, Interface) {
        let bus = MemoryBus::new();
        bus.register_object(SVC, PATH)
            .property(SVC, "Integer", 12i32)
            .property(SVC, "String", "hello")
            .method(SVC, "Echo", |args| Ok(args.to_vec()));
        let connection = Connection::new(bus.connect());
        (bus, Interface::new(&connection, SVC, PATH, SVC))
    }

    #[tokio::test]
    async fn test_property_helpers() {
        let (_bus, iface) = setup();
        assert_eq!(iface.get_property("Integer").await, Value::Int32(12));
        assert_eq!(iface.get_property("Missing").await, Value::Invalid);

        let all = iface.get_all_properties().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all["String"], Value::from("hello"));
    }

    #[tokio::test]
    async fn test_set_property_is_fire_and_forget() {
        let (bus, iface) = setup();
        assert!(iface.set_property("Integer", 40i32));
        assert_eq!(iface.get_property("Integer").await, Value::Int32(12));

        bus.dispatch();
        assert_eq!(iface.get_property("Integer").await, Value::Int32(40));
    }

    #[tokio::test]
    async fn test_calls_through_facade() {
        let (bus, iface) = setup();
        let context = Context::new();

        let reply = iface.blocking_call("Echo", ("x",)).await.unwrap();
        assert_eq!(reply, vec![WireValue::String("x".into())]);

        let call = iface
            .typed_call(&context, "Echo", &[TypedArg::new("u", 5)])
            .unwrap();
        bus.dispatch();
        assert_eq!(call.reply(), Some(Ok(vec![WireValue::UInt32(5)])));
    }
}
