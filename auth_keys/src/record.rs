//! The in memory form of one authorized_keys line. A record holds the key options, the key
//! itself and some bookkeeping about where it came from, every field is addressable through
//! [`Field`] so that callers (and the line codec) never need to know the struct layout.

use crate::codec;
use crate::error::FieldError;
use crate::validator;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// How a field is written into and read out of a key line
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldKind {
    /// `name="value"` option
    Substitution,
    /// bare option such as `no-pty`, present only when true
    Flag,
    /// whitespace separated `NAME=value` tokens
    List,
    /// key type, key data and note, written as is
    Text,
}

/// Every field of a record, in the order they appear in a rendered line
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Field {
    Command,
    Permitopen,
    Tunnel,
    From,
    Environment,
    NoAgentForwarding,
    NoPortForwarding,
    NoPty,
    NoUserRc,
    NoX11Forwarding,
    KeyType,
    KeyData,
    Note,
}

pub const FIELDS: [Field; 13] = [
    Field::Command,
    Field::Permitopen,
    Field::Tunnel,
    Field::From,
    Field::Environment,
    Field::NoAgentForwarding,
    Field::NoPortForwarding,
    Field::NoPty,
    Field::NoUserRc,
    Field::NoX11Forwarding,
    Field::KeyType,
    Field::KeyData,
    Field::Note,
];

pub const FLAG_FIELDS: [Field; 5] = [
    Field::NoAgentForwarding,
    Field::NoPortForwarding,
    Field::NoPty,
    Field::NoUserRc,
    Field::NoX11Forwarding,
];

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Field::Command => "command",
            Field::Permitopen => "permitopen",
            Field::Tunnel => "tunnel",
            Field::From => "from",
            Field::Environment => "environment",
            Field::NoAgentForwarding => "no_agent_forwarding",
            Field::NoPortForwarding => "no_port_forwarding",
            Field::NoPty => "no_pty",
            Field::NoUserRc => "no_user_rc",
            Field::NoX11Forwarding => "no_X11_forwarding",
            Field::KeyType => "key_type",
            Field::KeyData => "key_data",
            Field::Note => "note",
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Command | Field::Permitopen | Field::Tunnel | Field::From => {
                FieldKind::Substitution
            }
            Field::Environment => FieldKind::List,
            Field::NoAgentForwarding
            | Field::NoPortForwarding
            | Field::NoPty
            | Field::NoUserRc
            | Field::NoX11Forwarding => FieldKind::Flag,
            Field::KeyType | Field::KeyData | Field::Note => FieldKind::Text,
        }
    }

    /// The spelling used inside an authorized_keys line, underscores become hyphens
    /// so `no_X11_forwarding` is written `no-X11-forwarding`
    pub fn option_name(&self) -> String {
        self.name().replace('_', "-")
    }

    /// Looks a field up by either its name or its option spelling
    pub fn from_name(name: &str) -> Option<Field> {
        let name = name.trim().replace('-', "_");
        FIELDS
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(&name))
            .copied()
    }
}

impl Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Field, Self::Err> {
        Field::from_name(s).ok_or_else(|| format!("unknown field {s}"))
    }
}

/// The stored value of a boolean option. Values that came from an untyped source and are
/// not `true`/`false` are kept as text so validation can report them
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Other(String),
}

impl FlagValue {
    pub fn parse(value: &str) -> FlagValue {
        match value.trim() {
            "true" => FlagValue::Bool(true),
            "false" => FlagValue::Bool(false),
            other => FlagValue::Other(other.to_string()),
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, FlagValue::Bool(true))
    }
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        FlagValue::Bool(value)
    }
}

impl Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FlagValue::Bool(b) => write!(f, "{b}"),
            FlagValue::Other(s) => write!(f, "{s}"),
        }
    }
}

/// One authorized_keys entry
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Forced command run instead of the one requested by the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// `host:port` the key may open connections to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permitopen: Option<String>,
    /// Tunnel device number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<String>,
    /// Host or address pattern the client must connect from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// `NAME=value` pairs in the order they were given
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_agent_forwarding: Option<FlagValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_port_forwarding: Option<FlagValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_pty: Option<FlagValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_user_rc: Option<FlagValue>,
    #[serde(
        default,
        rename = "no_X11_forwarding",
        skip_serializing_if = "Option::is_none"
    )]
    pub no_x11_forwarding: Option<FlagValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<String>,
    /// Base64 public key blob, also the identity of the record within a file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    #[serde(skip)]
    raw_line: Option<String>,
    #[serde(skip)]
    saved: bool,
    #[serde(skip)]
    errors: Vec<FieldError>,
}

impl Record {
    pub fn new() -> Self {
        Record::default()
    }

    /// Builds a record from a line of the key file, see [`codec::parse`]
    pub fn parse(line: &str) -> Self {
        codec::parse(line)
    }

    /// Text of the line this record was last read from or written as
    pub fn raw_line(&self) -> Option<&str> {
        self.raw_line.as_deref()
    }

    /// True once the record has been loaded from or written to the key file
    pub fn saved(&self) -> bool {
        self.saved
    }

    /// Problems found by the most recent validation
    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    pub(crate) fn set_raw_line(&mut self, raw_line: String) {
        self.raw_line = Some(raw_line);
    }

    pub(crate) fn set_saved(&mut self, saved: bool) {
        self.saved = saved;
    }

    pub(crate) fn set_errors(&mut self, errors: Vec<FieldError>) {
        self.errors = errors;
    }

    /// A record can only be written out when it has both a key type and key data
    pub fn is_complete(&self) -> bool {
        self.key_type.is_some() && self.key_data.is_some()
    }

    /// Runs the validator, replacing [`Record::errors`]
    pub fn validate(&mut self) -> bool {
        validator::validate(self)
    }

    /// Like the `saved` getter but a record that no longer validates is never
    /// considered saved
    pub fn is_saved(&mut self) -> bool {
        self.validate() && self.saved
    }

    /// Validates and renders the line that would be written to the key file
    pub fn to_line(&mut self) -> Option<String> {
        if !self.validate() {
            return None;
        }
        codec::render(self)
    }

    pub fn flag(&self, field: Field) -> Option<&FlagValue> {
        match field {
            Field::NoAgentForwarding => self.no_agent_forwarding.as_ref(),
            Field::NoPortForwarding => self.no_port_forwarding.as_ref(),
            Field::NoPty => self.no_pty.as_ref(),
            Field::NoUserRc => self.no_user_rc.as_ref(),
            Field::NoX11Forwarding => self.no_x11_forwarding.as_ref(),
            _ => None,
        }
    }

    fn flag_slot(&mut self, field: Field) -> Option<&mut Option<FlagValue>> {
        match field {
            Field::NoAgentForwarding => Some(&mut self.no_agent_forwarding),
            Field::NoPortForwarding => Some(&mut self.no_port_forwarding),
            Field::NoPty => Some(&mut self.no_pty),
            Field::NoUserRc => Some(&mut self.no_user_rc),
            Field::NoX11Forwarding => Some(&mut self.no_x11_forwarding),
            _ => None,
        }
    }

    fn text_slot(&mut self, field: Field) -> Option<&mut Option<String>> {
        match field {
            Field::Command => Some(&mut self.command),
            Field::Permitopen => Some(&mut self.permitopen),
            Field::Tunnel => Some(&mut self.tunnel),
            Field::From => Some(&mut self.from),
            Field::KeyType => Some(&mut self.key_type),
            Field::KeyData => Some(&mut self.key_data),
            Field::Note => Some(&mut self.note),
            _ => None,
        }
    }

    fn text(&self, field: Field) -> Option<&String> {
        match field {
            Field::Command => self.command.as_ref(),
            Field::Permitopen => self.permitopen.as_ref(),
            Field::Tunnel => self.tunnel.as_ref(),
            Field::From => self.from.as_ref(),
            Field::KeyType => self.key_type.as_ref(),
            Field::KeyData => self.key_data.as_ref(),
            Field::Note => self.note.as_ref(),
            _ => None,
        }
    }

    /// Sets a boolean option, does nothing for non flag fields
    pub fn set_flag(&mut self, field: Field, value: bool) {
        if let Some(slot) = self.flag_slot(field) {
            *slot = Some(FlagValue::Bool(value));
        }
    }

    /// Sets every boolean option at once
    pub fn set_all_flags(&mut self, value: bool) {
        for field in FLAG_FIELDS {
            self.set_flag(field, value);
        }
    }

    /// Assigns a field from text. Flags take `true` or `false`, anything else is kept as is
    /// and will fail validation. The environment takes whitespace separated tokens
    pub fn set_field(&mut self, field: Field, value: &str) {
        match field.kind() {
            FieldKind::Flag => {
                if let Some(slot) = self.flag_slot(field) {
                    *slot = Some(FlagValue::parse(value));
                }
            }
            FieldKind::List => {
                self.environment = value.split_whitespace().map(|v| v.to_string()).collect();
            }
            FieldKind::Substitution | FieldKind::Text => {
                if let Some(slot) = self.text_slot(field) {
                    *slot = Some(value.to_string());
                }
            }
        }
    }

    pub fn clear_field(&mut self, field: Field) {
        match field.kind() {
            FieldKind::Flag => {
                if let Some(slot) = self.flag_slot(field) {
                    *slot = None;
                }
            }
            FieldKind::List => self.environment.clear(),
            FieldKind::Substitution | FieldKind::Text => {
                if let Some(slot) = self.text_slot(field) {
                    *slot = None;
                }
            }
        }
    }

    /// Text form of a field, used for searching. Unset fields have none
    pub fn field_value(&self, field: Field) -> Option<String> {
        match field.kind() {
            FieldKind::Flag => self.flag(field).map(|v| v.to_string()),
            FieldKind::List => {
                if self.environment.is_empty() {
                    None
                } else {
                    Some(self.environment.join(" "))
                }
            }
            FieldKind::Substitution | FieldKind::Text => self.text(field).cloned(),
        }
    }

    /// What this field contributes to a rendered line, if anything
    pub fn raw_field(&self, field: Field) -> Option<String> {
        match field.kind() {
            FieldKind::Flag => match self.flag(field) {
                Some(value) if value.is_true() => Some(field.option_name()),
                _ => None,
            },
            FieldKind::List => self.field_value(field),
            FieldKind::Substitution => self
                .text(field)
                .map(|value| format!("{}=\"{}\"", field.name(), value)),
            FieldKind::Text => self.text(field).cloned(),
        }
    }
}
