//! Conversion between authorized_keys lines and [`Record`]s.
//!
//! A line has the shape
//!
//! ```text
//! command="...",permitopen="...",tunnel="...",from="...",no-pty,... ENV=val ... key_type key_data note
//! ```
//!
//! where everything before `key_type` is optional. Parsing is forgiving, a field whose
//! pattern is not found is simply left unset and a line that matches nothing at all
//! produces an empty record which the validator will reject. Rendering is strict and
//! only produces output for records that validate and would parse back unchanged.

use crate::record::{Field, FieldKind, Record, FIELDS};
use crate::validator;
use regex::{Captures, Regex};
use std::borrow::Cow;

/// Key types the parser recognizes
pub const KEY_TYPES: [&str; 6] = [
    "ssh-rsa",
    "ssh-dss",
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
];

lazy_static! {
    static ref KEY_RE: Regex = Regex::new(&format!(
        r"(?:^|[ \t])({})[ \t]+([A-Za-z0-9/+]+={{0,3}})",
        KEY_TYPES.join("|")
    ))
    .expect("Unable to compile regular expression");
    static ref NOTE_RE: Regex = Regex::new(r"^[ \t](?:.*[ \t])?([A-Za-z0-9_/+@.\-]+)[ \t]*$")
        .expect("Unable to compile regular expression");
    static ref NOTE_TOKEN_RE: Regex =
        Regex::new(r"^[A-Za-z0-9_/+@.\-]+$").expect("Unable to compile regular expression");
    static ref QUOTED_RE: Regex =
        Regex::new(r#""[^"]*""#).expect("Unable to compile regular expression");
    static ref ENVIRONMENT_RE: Regex = Regex::new(r#"(?:^|[ \t,])([A-Z0-9_]+=[^ \t"]+)"#)
        .expect("Unable to compile regular expression");
    static ref ENVIRONMENT_TOKEN_RE: Regex = Regex::new(r#"^[A-Z0-9_]+=[^ \t\r\n",]+$"#)
        .expect("Unable to compile regular expression");
    /// One pattern per option field. Matched against the line with quoted values blanked,
    /// for substitutions the first group spans the value
    static ref OPTION_PATTERNS: Vec<(Field, Regex)> = FIELDS
        .iter()
        .filter_map(|field| {
            let pattern = match field.kind() {
                FieldKind::Substitution => {
                    format!(r#"(?:^|[ \t,]){}="([^"]*)"(?:[ \t,]|$)"#, field.name())
                }
                FieldKind::Flag => format!(r"(?:^|[ \t,])({})(?:[ \t,]|$)", field.option_name()),
                _ => return None,
            };
            Some((
                *field,
                Regex::new(&pattern).expect("Unable to compile regular expression"),
            ))
        })
        .collect();
}

/// Replaces the inside of every quoted value with spaces. The result has the same length
/// as `line` so offsets found in it index `line` as well
fn blank_quoted(line: &str) -> Cow<str> {
    QUOTED_RE.replace_all(line, |caps: &Captures| {
        format!("\"{}\"", " ".repeat(caps[0].len() - 2))
    })
}

/// Whether parse would keep this as the value of a substitution option
fn is_substitution_value(field: Field, value: &str) -> bool {
    if value.is_empty() || value.contains(['"', '\n', '\r']) {
        return false;
    }
    field != Field::Tunnel || value.bytes().all(|b| b.is_ascii_digit())
}

/// Builds a record out of one line of an authorized_keys file. Never fails, fields that
/// can not be found are left unset
pub fn parse(line: &str) -> Record {
    let line = line.trim();
    let mut record = Record::new();
    record.set_raw_line(line.to_string());

    // quoted values may contain anything, including text that looks like a key or a flag
    let blanked = blank_quoted(line);

    // the options section is everything in front of the key, when there is no key
    // we have to look at the whole line
    let key = KEY_RE
        .captures(&blanked)
        .and_then(|caps| Some((caps.get(1)?.range(), caps.get(2)?.range())));
    let options_end = match key {
        Some((key_type, key_data)) => {
            record.key_type = Some(line[key_type.clone()].to_string());
            record.key_data = Some(line[key_data.clone()].to_string());
            if let Some(note) = NOTE_RE.captures(&line[key_data.end..]) {
                record.note = Some(note[1].to_string());
            }
            key_type.start
        }
        None => line.len(),
    };
    let options = &line[..options_end];
    let bare_options = &blanked[..options_end];

    for (field, pattern) in OPTION_PATTERNS.iter() {
        match field.kind() {
            FieldKind::Substitution => {
                let span = pattern.captures(bare_options).and_then(|caps| caps.get(1));
                if let Some(span) = span {
                    let value = &options[span.range()];
                    if is_substitution_value(*field, value) {
                        record.set_field(*field, value);
                    }
                }
            }
            FieldKind::Flag => {
                if pattern.is_match(bare_options) {
                    record.set_flag(*field, true);
                }
            }
            _ => {}
        }
    }

    record.environment = ENVIRONMENT_RE
        .captures_iter(bare_options)
        .map(|caps| caps[1].to_string())
        .collect();

    trace!("parsed {:?} into {:?}", line, record);
    record
}

/// Produces the line for a record, or nothing if the record does not validate or holds
/// text that would not read back as the same record
///
/// Substitution options come first followed by flags, together they form one comma
/// separated option list without spaces. Environment tokens, key type, key data and note
/// follow separated by single spaces.
pub fn render(record: &Record) -> Option<String> {
    if !validator::check(record).is_empty() || !reparses(record) {
        return None;
    }

    let options: Vec<String> = FIELDS
        .iter()
        .filter(|f| f.kind() == FieldKind::Substitution)
        .chain(FIELDS.iter().filter(|f| f.kind() == FieldKind::Flag))
        .filter_map(|f| record.raw_field(*f))
        .collect();

    let mut groups = Vec::new();
    if !options.is_empty() {
        groups.push(options.join(","));
    }
    if let Some(environment) = record.raw_field(Field::Environment) {
        groups.push(environment);
    }
    for field in [Field::KeyType, Field::KeyData, Field::Note] {
        if let Some(value) = record.raw_field(field) {
            groups.push(value);
        }
    }

    Some(groups.join(" "))
}

/// True when every field would come back out of [`parse`] unchanged
fn reparses(record: &Record) -> bool {
    let substitutions = FIELDS
        .iter()
        .filter(|f| f.kind() == FieldKind::Substitution)
        .all(|f| match record.field_value(*f) {
            Some(value) => is_substitution_value(*f, &value),
            None => true,
        });

    substitutions
        && record
            .environment
            .iter()
            .all(|token| ENVIRONMENT_TOKEN_RE.is_match(token))
        && record
            .key_type
            .as_deref()
            .map_or(true, |key_type| KEY_TYPES.contains(&key_type))
        && record
            .note
            .as_deref()
            .map_or(true, |note| NOTE_TOKEN_RE.is_match(note))
}
