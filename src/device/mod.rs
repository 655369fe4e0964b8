//! Typed device models over the raw CoAP status dictionary.
//!
//! A device reports its state as an opaque `{key: primitive}` mapping. Each
//! model describes its semantic attributes in a static [`DeviceModel`] table
//! (attribute name, decoder, optional encoder with its admissible value set),
//! and [`DeviceState`] interprets that table: it decodes attributes out of the
//! raw dictionary, coerces and applies inbound writes, and queues the minimal
//! raw sub-mappings (commands) that have to be pushed back to the device.

pub mod hu1508;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Primitive value as carried on the CoAP wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Int(i64),
    Float(f64),
    Text(String),
}

/// The verbatim status dictionary reported by a device.
pub type RawStatus = HashMap<String, RawValue>;

/// Decoded value of a semantic attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// A member of an enumerated value set, by name.
    Member(&'static str),
    Int(i64),
    Float(f64),
    Text(String),
    /// No meaningful value (e.g. error code 0).
    Empty,
}

impl PropertyValue {
    /// Text form used as MQTT payload.
    pub fn to_payload(&self) -> String {
        match self {
            PropertyValue::Member(name) => (*name).to_string(),
            PropertyValue::Int(value) => value.to_string(),
            // {:?} keeps the decimal point on round floats ("100.0", not "100")
            PropertyValue::Float(value) => format!("{:?}", value),
            PropertyValue::Text(value) => value.clone(),
            PropertyValue::Empty => "null".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),
    #[error("attribute {0} is read-only")]
    ReadOnly(String),
    #[error("invalid value for {attribute}: {value}")]
    InvalidValue { attribute: String, value: String },
}

/// Values an attribute writer accepts.
pub enum Admissible {
    /// Enumerated members as `(name, wire code)` pairs; coerced by name.
    Members(&'static [(&'static str, i64)]),
    /// A fixed set of integer literals; coerced by integer parse.
    Literals(&'static [i64]),
}

impl Admissible {
    /// Coerces inbound text into a wire code, or `None` if inadmissible.
    fn coerce(&self, value: &str) -> Option<i64> {
        match self {
            Admissible::Members(members) => members
                .iter()
                .find(|(name, _)| *name == value)
                .map(|(_, code)| *code),
            Admissible::Literals(literals) => value
                .trim()
                .parse()
                .ok()
                .filter(|parsed| literals.contains(parsed)),
        }
    }

    fn values(&self) -> Vec<String> {
        match self {
            Admissible::Members(members) => {
                members.iter().map(|(name, _)| (*name).to_string()).collect()
            }
            Admissible::Literals(literals) => {
                literals.iter().map(|literal| literal.to_string()).collect()
            }
        }
    }
}

/// Writer half of an attribute.
pub struct WriteSpec {
    pub admissible: Admissible,
    /// Whether the device must be powered on for this write to take effect.
    pub forces_power_on: bool,
    /// Skip mutation and command when the encoded keys already hold the
    /// target values (the power switch uses this).
    pub skip_when_unchanged: bool,
    /// Encodes a wire code into the raw keys it affects. Every returned key
    /// ends up in a single command so the device observes an atomic change.
    pub encode: fn(i64) -> Vec<(&'static str, RawValue)>,
}

pub struct AttributeSpec {
    pub name: &'static str,
    pub read: fn(&RawStatus) -> PropertyValue,
    pub write: Option<WriteSpec>,
}

/// Static description of one device model.
pub struct DeviceModel {
    pub name: &'static str,
    pub attributes: &'static [AttributeSpec],
}

impl DeviceModel {
    pub fn attribute(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.iter().find(|spec| spec.name == name)
    }
}

/// Attribute every model routes implicit power-on writes through.
const POWER_ATTRIBUTE: &str = "power_status";
const POWER_ON: &str = "ON";

/// Creates the state object for a model name, as used in the configuration.
pub fn create(model: &str) -> Option<DeviceState> {
    match model {
        "hu1508" | "philips_hu1508" => Some(DeviceState::new(&hu1508::MODEL)),
        _ => None,
    }
}

/// Current state of one device: the raw dictionary plus the pending commands
/// synthesized by attribute writes.
pub struct DeviceState {
    model: &'static DeviceModel,
    raw: RawStatus,
    commands: Vec<RawStatus>,
}

impl DeviceState {
    pub fn new(model: &'static DeviceModel) -> Self {
        Self {
            model,
            raw: RawStatus::new(),
            commands: Vec::new(),
        }
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name
    }

    pub fn raw(&self) -> &RawStatus {
        &self.raw
    }

    /// Replaces the raw dictionary with a fresh device snapshot.
    pub fn replace_raw(&mut self, raw: RawStatus) {
        self.raw = raw;
    }

    /// Decodes one attribute. Readers are total: missing keys decode to the
    /// attribute's documented default.
    pub fn read(&self, attribute: &str) -> Option<PropertyValue> {
        self.model
            .attribute(attribute)
            .map(|spec| (spec.read)(&self.raw))
    }

    /// Coerces `value` into the attribute's admissible set, mutates the raw
    /// dictionary and queues the resulting command. Writers that require the
    /// device to be on queue a power-on command first, iff power changes.
    pub fn write(&mut self, attribute: &str, value: &str) -> Result<(), DeviceError> {
        let model = self.model;
        let spec = model
            .attribute(attribute)
            .ok_or_else(|| DeviceError::UnknownAttribute(attribute.to_string()))?;
        let write = spec
            .write
            .as_ref()
            .ok_or_else(|| DeviceError::ReadOnly(attribute.to_string()))?;
        let code = write
            .admissible
            .coerce(value)
            .ok_or_else(|| DeviceError::InvalidValue {
                attribute: attribute.to_string(),
                value: value.to_string(),
            })?;

        if write.forces_power_on {
            self.write(POWER_ATTRIBUTE, POWER_ON)?;
        }

        let updates = (write.encode)(code);
        if write.skip_when_unchanged
            && updates
                .iter()
                .all(|(key, value)| self.raw.get(*key) == Some(value))
        {
            return Ok(());
        }

        let mut command = RawStatus::new();
        for (key, value) in updates {
            self.raw.insert(key.to_string(), value.clone());
            command.insert(key.to_string(), value);
        }
        self.commands.push(command);
        Ok(())
    }

    /// Returns and clears the pending command queue.
    pub fn drain_commands(&mut self) -> Vec<RawStatus> {
        std::mem::take(&mut self.commands)
    }

    /// Flat `attribute -> value` view in declaration order, as published over
    /// MQTT.
    pub fn as_dict(&self) -> Vec<(&'static str, PropertyValue)> {
        self.model
            .attributes
            .iter()
            .map(|spec| (spec.name, (spec.read)(&self.raw)))
            .collect()
    }

    /// Admissible values of a writable attribute; `None` for read-only ones.
    pub fn admissible_values(&self, attribute: &str) -> Option<Vec<String>> {
        self.model
            .attribute(attribute)
            .and_then(|spec| spec.write.as_ref())
            .map(|write| write.admissible.values())
    }
}
