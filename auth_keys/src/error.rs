use crate::record::Field;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};

/// Failures that abort an operation on the key file. Validation problems with an
/// individual record are not errors of this kind, see [`FieldError`]
#[derive(Debug)]
pub enum AuthKeysError {
    IOError(std::io::Error),
    LockError { path: PathBuf, error: std::io::Error },
    PersistError(std::io::Error),
    RegexError(regex::Error),
    TomlDeError(toml::de::Error),
    ConfigError(String),
    RecordInvalid(String),
}

impl From<std::io::Error> for AuthKeysError {
    fn from(error: std::io::Error) -> Self {
        AuthKeysError::IOError(error)
    }
}
impl From<regex::Error> for AuthKeysError {
    fn from(error: regex::Error) -> Self {
        AuthKeysError::RegexError(error)
    }
}
impl From<toml::de::Error> for AuthKeysError {
    fn from(error: toml::de::Error) -> Self {
        AuthKeysError::TomlDeError(error)
    }
}
impl From<tempfile::PersistError> for AuthKeysError {
    fn from(error: tempfile::PersistError) -> Self {
        AuthKeysError::PersistError(error.error)
    }
}

impl Display for AuthKeysError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            AuthKeysError::IOError(e) => write!(f, "{e}"),
            AuthKeysError::LockError { path, error } => {
                write!(f, "Could not lock {}: {error}", path.display())
            }
            AuthKeysError::PersistError(e) => write!(f, "Failed to replace key file: {e}"),
            AuthKeysError::RegexError(e) => write!(f, "{e}"),
            AuthKeysError::TomlDeError(e) => write!(f, "{e}"),
            AuthKeysError::ConfigError(e) => write!(f, "Invalid configuration: {e}"),
            AuthKeysError::RecordInvalid(e) => write!(f, "{e}"),
        }
    }
}

impl Error for AuthKeysError {}

/// A single problem found by the validator, tagged with the field it concerns
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FieldError {
    DataNil,
    TypeNil,
    DataChar,
    DataShort,
    DataLong,
    DataModulus,
    Bool(Field),
}

impl FieldError {
    /// Short machine readable tag, `data_nil`, `bool` and so on
    pub fn tag(&self) -> &'static str {
        match self {
            FieldError::DataNil => "data_nil",
            FieldError::TypeNil => "type_nil",
            FieldError::DataChar => "data_char",
            FieldError::DataShort => "data_short",
            FieldError::DataLong => "data_long",
            FieldError::DataModulus => "data_modulus",
            FieldError::Bool(_) => "bool",
        }
    }

    pub fn field(&self) -> Field {
        match self {
            FieldError::TypeNil => Field::KeyType,
            FieldError::Bool(field) => *field,
            _ => Field::KeyData,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            FieldError::DataNil => "public key is missing",
            FieldError::TypeNil => "missing key type",
            FieldError::DataChar => "public key contains invalid base64 characters",
            FieldError::DataShort => "public key is too short",
            FieldError::DataLong => "public key is too long",
            FieldError::DataModulus => "public key length is not a modulus of 4",
            FieldError::Bool(_) => "bad value for boolean field",
        }
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}: {}", self.field().name(), self.message())
    }
}
