//! The bus's own object: `org.freedesktop.DBus`.
//!
//! The driver is a method table indexed by `(interface, member)` with
//! unknown-method and unknown-interface catch-alls. It runs inside the
//! router task and manipulates the router's registry, subscription table,
//! and policy store directly; replies are handed back to the router for
//! delivery to the caller.
//!
//! Method calls with an omitted interface resolve against the bus interface,
//! which is what real clients (and `dbus-send`) rely on.

use minibus_core::message::MessageKind;
use minibus_core::names::{is_valid_bus_name, is_valid_well_known_name, BUS_NAME};
use minibus_core::signature::Type;
use minibus_core::{MatchRule, Message, Value};

use crate::error::name as error_name;
use crate::observer::BusEvent;
use crate::peer::PeerId;
use crate::registry::NameFlags;
use crate::router::Router;

/// The bus interface.
pub(crate) const BUS_INTERFACE: &str = "org.freedesktop.DBus";
/// Introspection.
pub(crate) const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
/// Liveness and machine identity.
pub(crate) const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
/// Property access.
pub(crate) const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Introspection data for the bus object.
const INTROSPECTION_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.freedesktop.DBus">
    <method name="Hello">
      <arg direction="out" type="s"/>
    </method>
    <method name="RequestName">
      <arg direction="in" type="s"/>
      <arg direction="in" type="u"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="ReleaseName">
      <arg direction="in" type="s"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="GetNameOwner">
      <arg direction="in" type="s"/>
      <arg direction="out" type="s"/>
    </method>
    <method name="ListNames">
      <arg direction="out" type="as"/>
    </method>
    <method name="ListActivatableNames">
      <arg direction="out" type="as"/>
    </method>
    <method name="NameHasOwner">
      <arg direction="in" type="s"/>
      <arg direction="out" type="b"/>
    </method>
    <method name="AddMatch">
      <arg direction="in" type="s"/>
    </method>
    <method name="RemoveMatch">
      <arg direction="in" type="s"/>
    </method>
    <method name="GetId">
      <arg direction="out" type="s"/>
    </method>
    <signal name="NameOwnerChanged">
      <arg type="s"/>
      <arg type="s"/>
      <arg type="s"/>
    </signal>
  </interface>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg direction="out" type="s"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Peer">
    <method name="Ping"/>
    <method name="GetMachineId">
      <arg direction="out" type="s"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Properties">
    <method name="Get">
      <arg direction="in" type="s"/>
      <arg direction="in" type="s"/>
      <arg direction="out" type="v"/>
    </method>
    <method name="GetAll">
      <arg direction="in" type="s"/>
      <arg direction="out" type="a{sv}"/>
    </method>
  </interface>
</node>
"#;

/// A handler outcome: a reply body, or an error name plus text.
type MethodResult = Result<Message, (&'static str, String)>;

/// `true` for the one message a peer may send before it has a unique name.
pub(crate) fn is_hello(message: &Message) -> bool {
    message.kind() == MessageKind::MethodCall
        && message.member.as_deref() == Some("Hello")
        && message.interface.as_deref().unwrap_or(BUS_INTERFACE) == BUS_INTERFACE
        && message.destination.as_deref().unwrap_or(BUS_NAME) == BUS_NAME
}

/// Dispatches a message addressed to the bus. Returns the stamped reply to
/// deliver to the caller, or `None` (non-calls, and calls that declined a
/// reply — their side effects still happen).
pub(crate) fn dispatch(router: &mut Router, from: PeerId, message: &Message) -> Option<Message> {
    if message.kind() != MessageKind::MethodCall {
        return None; // signals and replies addressed to the bus are ignored
    }

    let member = message.member.as_deref().unwrap_or("");
    let result = match message.interface.as_deref() {
        None | Some(BUS_INTERFACE) => dispatch_bus(router, from, message, member),
        Some(INTROSPECTABLE_INTERFACE) => match member {
            "Introspect" => Ok(Message::method_return(message.serial)
                .with_body_value(Value::String(INTROSPECTION_XML.to_owned()))),
            _ => Err(unknown_method(INTROSPECTABLE_INTERFACE, member)),
        },
        Some(PEER_INTERFACE) => match member {
            "Ping" => Ok(Message::method_return(message.serial)),
            "GetMachineId" => Ok(Message::method_return(message.serial)
                .with_body_value(Value::String(router.config.machine_id.clone()))),
            _ => Err(unknown_method(PEER_INTERFACE, member)),
        },
        Some(PROPERTIES_INTERFACE) => dispatch_properties(message, member),
        Some(other) => Err((
            error_name::UNKNOWN_INTERFACE,
            format!("no such interface {other} on the bus object"),
        )),
    };

    if message.flags.no_reply_expected() {
        return None;
    }

    let caller = router
        .peers
        .get(&from)
        .and_then(|entry| entry.unique.clone());
    let reply = match result {
        Ok(reply) => reply,
        Err((name, text)) => Message::error(name, message.serial)
            .with_body_value(Value::String(text)),
    };
    let mut reply = reply
        .with_sender(BUS_NAME)
        .with_serial(router.counters.next_serial());
    reply.destination = caller;
    Some(reply)
}

fn dispatch_bus(
    router: &mut Router,
    from: PeerId,
    message: &Message,
    member: &str,
) -> MethodResult {
    match member {
        "Hello" => handle_hello(router, from, message),
        "RequestName" => handle_request_name(router, from, message),
        "ReleaseName" => handle_release_name(router, from, message),
        "GetNameOwner" => handle_get_name_owner(router, message),
        "ListNames" => handle_list_names(router, message),
        "ListActivatableNames" => Ok(Message::method_return(message.serial)
            .with_body_value(Value::string_array(Vec::<String>::new()))),
        "NameHasOwner" => handle_name_has_owner(router, message),
        "AddMatch" => handle_add_match(router, from, message),
        "RemoveMatch" => handle_remove_match(router, from, message),
        "GetId" => Ok(Message::method_return(message.serial)
            .with_body_value(Value::String(router.config.bus_id.clone()))),
        _ => Err(unknown_method(BUS_INTERFACE, member)),
    }
}

fn handle_hello(router: &mut Router, from: PeerId, message: &Message) -> MethodResult {
    let Some(entry) = router.peers.get(&from) else {
        return Err((error_name::FAILED, "unknown connection".to_owned()));
    };
    if entry.unique.is_some() {
        return Err((
            error_name::FAILED,
            "Hello may only be called once per connection".to_owned(),
        ));
    }
    let uid = entry.handle.uid;

    let unique = router.registry.assign_unique();
    let event = router.registry.register_unique(&unique, from);
    router.policy.install_defaults(&unique, uid);
    router
        .peers
        .get_mut(&from)
        .expect("checked above")
        .unique = Some(unique.clone());

    router.observer.emit(BusEvent::PeerUp {
        unique: unique.clone(),
        uid,
    });
    router.publish_name_events(vec![event]);

    Ok(Message::method_return(message.serial).with_body_value(Value::String(unique)))
}

fn handle_request_name(router: &mut Router, from: PeerId, message: &Message) -> MethodResult {
    let name = string_arg(message, 0)?;
    let flags = u32_arg(message, 1)?;
    if !is_valid_well_known_name(&name) || name == BUS_NAME {
        return Err((
            error_name::INVALID_ARGS,
            format!("{name:?} is not a requestable well-known name"),
        ));
    }

    let unique = caller_unique(router, from)?;
    if !router.policy.check_own(&unique, &name) {
        let detail = format!("{unique} may not own {name}");
        router.observer.emit(BusEvent::PolicyDenied {
            action: "own",
            unique,
            detail: detail.clone(),
        });
        return Err((error_name::ACCESS_DENIED, detail));
    }

    let (reply, events) = router
        .registry
        .request_name(&name, NameFlags(flags), from, &unique);
    router.publish_name_events(events);
    Ok(Message::method_return(message.serial).with_body_value(Value::UInt32(reply as u32)))
}

fn handle_release_name(router: &mut Router, from: PeerId, message: &Message) -> MethodResult {
    let name = string_arg(message, 0)?;
    if !is_valid_well_known_name(&name) || name == BUS_NAME {
        return Err((
            error_name::INVALID_ARGS,
            format!("{name:?} is not a releasable well-known name"),
        ));
    }

    let (reply, events) = router.registry.release_name(&name, from);
    router.publish_name_events(events);
    Ok(Message::method_return(message.serial).with_body_value(Value::UInt32(reply as u32)))
}

fn handle_get_name_owner(router: &Router, message: &Message) -> MethodResult {
    let name = string_arg(message, 0)?;
    if name == BUS_NAME {
        return Ok(Message::method_return(message.serial)
            .with_body_value(Value::String(BUS_NAME.to_owned())));
    }
    if !is_valid_bus_name(&name) {
        return Err((
            error_name::INVALID_ARGS,
            format!("{name:?} is not a valid bus name"),
        ));
    }
    match router.registry.owner_unique(&name) {
        Some(owner) => Ok(Message::method_return(message.serial)
            .with_body_value(Value::String(owner.to_owned()))),
        None => Err((
            error_name::NAME_HAS_NO_OWNER,
            format!("could not get owner of name {name:?}: no such name"),
        )),
    }
}

fn handle_list_names(router: &Router, message: &Message) -> MethodResult {
    let mut names = vec![BUS_NAME.to_owned()];
    names.extend(router.registry.well_known_names().map(str::to_owned));
    names.extend(router.registry.unique_names().map(str::to_owned));
    Ok(Message::method_return(message.serial).with_body_value(Value::string_array(names)))
}

fn handle_name_has_owner(router: &Router, message: &Message) -> MethodResult {
    let name = string_arg(message, 0)?;
    let has_owner = name == BUS_NAME || router.registry.owner_unique(&name).is_some();
    Ok(Message::method_return(message.serial).with_body_value(Value::Boolean(has_owner)))
}

fn handle_add_match(router: &mut Router, from: PeerId, message: &Message) -> MethodResult {
    let text = string_arg(message, 0)?;
    let rule = MatchRule::parse(&text)
        .map_err(|err| (error_name::MATCH_RULE_INVALID, err.to_string()))?;
    router.subscriptions.add(from, rule);
    Ok(Message::method_return(message.serial))
}

fn handle_remove_match(router: &mut Router, from: PeerId, message: &Message) -> MethodResult {
    let text = string_arg(message, 0)?;
    let rule = MatchRule::parse(&text)
        .map_err(|err| (error_name::MATCH_RULE_INVALID, err.to_string()))?;
    if !router.subscriptions.remove(from, &rule) {
        return Err((
            error_name::MATCH_RULE_NOT_FOUND,
            "no such match rule installed".to_owned(),
        ));
    }
    Ok(Message::method_return(message.serial))
}

fn dispatch_properties(message: &Message, member: &str) -> MethodResult {
    let empty = || Value::Variant(Box::new(Value::string_array(Vec::<String>::new())));
    match member {
        "Get" => {
            let interface = string_arg(message, 0)?;
            let property = string_arg(message, 1)?;
            if interface != BUS_INTERFACE {
                return Err((
                    error_name::UNKNOWN_INTERFACE,
                    format!("no properties on interface {interface:?}"),
                ));
            }
            match property.as_str() {
                "Features" | "Interfaces" => {
                    Ok(Message::method_return(message.serial).with_body_value(empty()))
                },
                _ => Err((
                    error_name::UNKNOWN_PROPERTY,
                    format!("no such property {property:?}"),
                )),
            }
        },
        "GetAll" => {
            let interface = string_arg(message, 0)?;
            if interface != BUS_INTERFACE {
                return Err((
                    error_name::UNKNOWN_INTERFACE,
                    format!("no properties on interface {interface:?}"),
                ));
            }
            let dict = Value::Array {
                elem: Type::DictEntry(Box::new(Type::String), Box::new(Type::Variant)),
                items: vec![
                    Value::DictEntry(
                        Box::new(Value::String("Features".to_owned())),
                        Box::new(empty()),
                    ),
                    Value::DictEntry(
                        Box::new(Value::String("Interfaces".to_owned())),
                        Box::new(empty()),
                    ),
                ],
            };
            Ok(Message::method_return(message.serial).with_body_value(dict))
        },
        // Set would be next, but the bus has no writable properties.
        _ => Err(unknown_method(PROPERTIES_INTERFACE, member)),
    }
}

fn unknown_method(interface: &str, member: &str) -> (&'static str, String) {
    (
        error_name::UNKNOWN_METHOD,
        format!("no such method {member:?} on interface {interface:?}"),
    )
}

fn caller_unique(router: &Router, from: PeerId) -> Result<String, (&'static str, String)> {
    router
        .peers
        .get(&from)
        .and_then(|entry| entry.unique.clone())
        .ok_or_else(|| (error_name::FAILED, "connection has no unique name".to_owned()))
}

fn string_arg(message: &Message, index: usize) -> Result<String, (&'static str, String)> {
    match message.body.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err((
            error_name::INVALID_ARGS,
            format!("argument {index} must be a string"),
        )),
    }
}

fn u32_arg(message: &Message, index: usize) -> Result<u32, (&'static str, String)> {
    match message.body.get(index) {
        Some(Value::UInt32(v)) => Ok(*v),
        _ => Err((
            error_name::INVALID_ARGS,
            format!("argument {index} must be a uint32"),
        )),
    }
}
