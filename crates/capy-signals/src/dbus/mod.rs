//! zbus-backed `SignalBus`
//!
//! Match rules go through `org.freedesktop.DBus.AddMatch`/`RemoveMatch`
//! on one shared connection; incoming signals are read from the
//! connection's message stream and handed to `NotificationCenter::dispatch`.

use crate::bus::{SignalBus, SignalEmission};
use crate::center::NotificationCenter;
use crate::config::BusKind;
use crate::dispatch::SignalOccurrence;
use crate::error::{BusError, SignalError};
use crate::rule::MatchRule;
use crate::types::{ArgumentInfo, SignalMetadata, Value};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use zbus::names::BusName;
use zbus::zvariant::{self, ObjectPath, Signature, StructureBuilder};
use zbus::{Connection, MessageStream};

pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Connect to `kind`, start dispatching and return the center with its bus.
pub async fn connect(kind: BusKind) -> Result<(NotificationCenter, Arc<ZbusBus>), SignalError> {
    let connection = match kind {
        BusKind::Session => Connection::session().await,
        BusKind::System => Connection::system().await,
    }
    .map_err(BusError::from)?;

    let bus = Arc::new(ZbusBus::new(connection).await?);
    let center = NotificationCenter::new(bus.clone(), Handle::current());
    bus.spawn_dispatcher(center.clone());

    info!("Notification center connected to the {:?} bus", kind);
    Ok((center, bus))
}

/// Signals of the bus daemon itself, for recording into a center.
pub fn daemon_signals() -> Vec<SignalMetadata> {
    vec![
        SignalMetadata::new(DBUS_INTERFACE, "NameOwnerChanged")
            .with_arg(ArgumentInfo::new("s").with_key("name"))
            .with_arg(ArgumentInfo::new("s").with_key("old_owner"))
            .with_arg(ArgumentInfo::new("s").with_key("new_owner")),
        SignalMetadata::new(DBUS_INTERFACE, "NameAcquired")
            .with_arg(ArgumentInfo::new("s").with_key("name")),
        SignalMetadata::new(DBUS_INTERFACE, "NameLost")
            .with_arg(ArgumentInfo::new("s").with_key("name")),
    ]
}

pub struct ZbusBus {
    connection: Connection,
    dbus: zbus::fdo::DBusProxy<'static>,
    exported: RwLock<HashSet<String>>,
}

impl ZbusBus {
    pub async fn new(connection: Connection) -> Result<Self, BusError> {
        let dbus = zbus::fdo::DBusProxy::new(&connection).await?;
        Ok(Self {
            connection,
            dbus,
            exported: RwLock::new(HashSet::new()),
        })
    }

    /// Serve `iface` at `path`; the path may then be used as a post sender.
    pub async fn export<I>(&self, path: &str, iface: I) -> Result<bool, BusError>
    where
        I: zbus::object_server::Interface,
    {
        let added = self.connection.object_server().at(path, iface).await?;
        self.exported
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string());
        debug!("Exported object at {}", path);
        Ok(added)
    }

    /// Read incoming signals and dispatch them to `center`.
    pub fn spawn_dispatcher(&self, center: NotificationCenter) -> JoinHandle<()> {
        let connection = self.connection.clone();
        tokio::spawn(async move {
            let mut stream = MessageStream::from(&connection);
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(msg) => {
                        if let Some(occurrence) = occurrence_from_message(&msg) {
                            center.dispatch(&occurrence);
                        }
                    }
                    Err(e) => warn!("D-Bus message error: {}", e),
                }
            }
            info!("D-Bus message stream ended");
        })
    }
}

impl SignalBus for ZbusBus {
    fn add_match(&self, rule: &MatchRule) -> BoxFuture<'static, Result<(), BusError>> {
        let dbus = self.dbus.clone();
        let rule = rule.clone();
        async move {
            dbus.add_match_rule(to_zbus_rule(&rule)?).await?;
            // Keep the owner of a well-known sender current while matched
            if let Some(name) = well_known_sender(&rule) {
                dbus.add_match_rule(owner_watch_rule(name)?).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn remove_match(&self, rule: &MatchRule) -> BoxFuture<'static, Result<(), BusError>> {
        let dbus = self.dbus.clone();
        let rule = rule.clone();
        async move {
            dbus.remove_match_rule(to_zbus_rule(&rule)?).await?;
            if let Some(name) = well_known_sender(&rule) {
                dbus.remove_match_rule(owner_watch_rule(name)?).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn name_owner(&self, bus_name: &str) -> BoxFuture<'static, Result<Option<String>, BusError>> {
        let dbus = self.dbus.clone();
        let name = bus_name.to_string();
        async move {
            let bus_name = BusName::try_from(name.as_str()).map_err(zbus::Error::from)?;
            match dbus.get_name_owner(bus_name).await {
                Ok(owner) => Ok(Some(owner.to_string())),
                Err(zbus::fdo::Error::NameHasNoOwner(_)) => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
        .boxed()
    }

    fn is_exported(&self, path: &str) -> bool {
        self.exported
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }

    fn emit(&self, emission: SignalEmission) -> BoxFuture<'static, Result<(), BusError>> {
        let connection = self.connection.clone();
        async move {
            let SignalEmission {
                interface,
                member,
                path,
                args,
            } = emission;

            if args.is_empty() {
                connection
                    .emit_signal(
                        None::<&str>,
                        path.as_str(),
                        interface.as_str(),
                        member.as_str(),
                        &(),
                    )
                    .await?;
                return Ok(());
            }

            let mut body = StructureBuilder::new();
            for arg in &args {
                body = body.append_field(to_zvalue(arg)?);
            }
            let body = body.build();
            connection
                .emit_signal(
                    None::<&str>,
                    path.as_str(),
                    interface.as_str(),
                    member.as_str(),
                    &body,
                )
                .await?;
            Ok(())
        }
        .boxed()
    }
}

/// Build the zbus rule for `rule`. Sender matches bus name and path.
fn to_zbus_rule(rule: &MatchRule) -> Result<zbus::MatchRule<'_>, zbus::Error> {
    let mut builder = zbus::MatchRule::builder().msg_type(zbus::message::Type::Signal);

    if let Some(interface) = &rule.interface {
        builder = builder.interface(interface.as_str())?;
    }
    if let Some(member) = &rule.member {
        builder = builder.member(member.as_str())?;
    }
    if let Some(sender) = &rule.sender {
        builder = builder.sender(sender.bus_name.as_str())?.path(sender.path.as_str())?;
    }
    if let Some(destination) = &rule.destination {
        builder = builder.destination(destination.as_str())?;
    }
    for (index, value) in &rule.filters {
        builder = builder.arg(*index, value.as_str())?;
    }

    Ok(builder.build())
}

fn well_known_sender(rule: &MatchRule) -> Option<&str> {
    rule.sender
        .as_ref()
        .map(|s| s.bus_name.as_str())
        .filter(|name| !name.starts_with(':') && *name != DBUS_INTERFACE)
}

/// `NameOwnerChanged` for `name` only.
fn owner_watch_rule(name: &str) -> Result<zbus::MatchRule<'_>, zbus::Error> {
    Ok(zbus::MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .sender(DBUS_INTERFACE)?
        .interface(DBUS_INTERFACE)?
        .member("NameOwnerChanged")?
        .arg(0, name)?
        .build())
}

fn to_zvalue(value: &Value) -> Result<zvariant::Value<'_>, BusError> {
    let converted = match value {
        Value::Bool(v) => zvariant::Value::Bool(*v),
        Value::Byte(v) => zvariant::Value::U8(*v),
        Value::Int16(v) => zvariant::Value::I16(*v),
        Value::UInt16(v) => zvariant::Value::U16(*v),
        Value::Int32(v) => zvariant::Value::I32(*v),
        Value::UInt32(v) => zvariant::Value::U32(*v),
        Value::Int64(v) => zvariant::Value::I64(*v),
        Value::UInt64(v) => zvariant::Value::U64(*v),
        Value::Double(v) => zvariant::Value::F64(*v),
        Value::Str(s) => zvariant::Value::from(s.as_str()),
        Value::ObjectPath(p) => zvariant::Value::ObjectPath(ObjectPath::try_from(p.as_str())?),
        Value::Signature(s) => zvariant::Value::Signature(Signature::try_from(s.as_str())?),
        Value::Variant(inner) => zvariant::Value::Value(Box::new(to_zvalue(inner)?)),
        other => return Err(BusError::Unsupported(format!("{:?}", other))),
    };
    Ok(converted)
}

fn from_zvalue(value: &zvariant::Value<'_>) -> Value {
    match value {
        zvariant::Value::Bool(v) => Value::Bool(*v),
        zvariant::Value::U8(v) => Value::Byte(*v),
        zvariant::Value::I16(v) => Value::Int16(*v),
        zvariant::Value::U16(v) => Value::UInt16(*v),
        zvariant::Value::I32(v) => Value::Int32(*v),
        zvariant::Value::U32(v) => Value::UInt32(*v),
        zvariant::Value::I64(v) => Value::Int64(*v),
        zvariant::Value::U64(v) => Value::UInt64(*v),
        zvariant::Value::F64(v) => Value::Double(*v),
        zvariant::Value::Str(s) => Value::Str(s.as_str().to_string()),
        zvariant::Value::ObjectPath(p) => Value::ObjectPath(p.as_str().to_string()),
        zvariant::Value::Signature(s) => Value::Signature(s.as_str().to_string()),
        zvariant::Value::Value(inner) => Value::Variant(Box::new(from_zvalue(inner))),
        zvariant::Value::Array(items) => Value::Array(items.iter().map(from_zvalue).collect()),
        zvariant::Value::Structure(fields) => {
            Value::Struct(fields.fields().iter().map(from_zvalue).collect())
        }
        other => Value::Opaque(format!("{:?}", other)),
    }
}

fn occurrence_from_message(msg: &zbus::Message) -> Option<SignalOccurrence> {
    let header = msg.header();
    if header.message_type() != zbus::message::Type::Signal {
        return None;
    }

    let mut occurrence = SignalOccurrence::new(
        header.interface()?.to_string(),
        header.member()?.to_string(),
        header.sender().map(|s| s.to_string()).unwrap_or_default(),
        header.path()?.to_string(),
    );
    if let Some(destination) = header.destination() {
        occurrence = occurrence.with_destination(destination.to_string());
    }

    let body = msg.body();
    let signature = body
        .signature()
        .map(|s| s.as_str().to_string())
        .unwrap_or_default();
    let fields = match body.deserialize::<zvariant::Structure<'_>>() {
        Ok(structure) => structure.fields().iter().map(from_zvalue).collect(),
        // Signals without arguments have no body to decode
        Err(_) => Vec::new(),
    };
    Some(occurrence.with_args(body_arguments(&signature, fields)))
}

/// A body that is one struct decodes as that struct's fields; put them
/// back into a single argument.
fn body_arguments(signature: &str, fields: Vec<Value>) -> Vec<Value> {
    if is_single_struct(signature) {
        vec![Value::Struct(fields)]
    } else {
        fields
    }
}

/// True for a signature made of exactly one struct type, e.g. "(ii)" but
/// not "(i)(s)" or "(i)s".
fn is_single_struct(signature: &str) -> bool {
    if !signature.starts_with('(') {
        return false;
    }
    let mut depth = 0usize;
    for (i, c) in signature.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i == signature.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}
