use crate::error::FieldError;
use crate::record::{FlagValue, Record, FLAG_FIELDS};
use regex::Regex;

/// Shortest key data we will accept
pub const MIN_KEY_DATA_LEN: usize = 30;
/// Longest key data we will accept
pub const MAX_KEY_DATA_LEN: usize = 1000;

lazy_static! {
    static ref BASE64_RE: Regex =
        Regex::new(r"^[A-Za-z0-9/+]+={0,3}$").expect("Unable to compile regular expression");
}

/// Computes the validation errors for a record without touching it. Missing key data or
/// key type end the check early, the remaining key data checks are independent and may
/// all fire at once
pub fn check(record: &Record) -> Vec<FieldError> {
    let mut errors = Vec::new();

    for field in FLAG_FIELDS {
        if let Some(FlagValue::Other(_)) = record.flag(field) {
            errors.push(FieldError::Bool(field));
        }
    }

    let key_data = match &record.key_data {
        Some(data) => data,
        None => {
            errors.push(FieldError::DataNil);
            return errors;
        }
    };
    if record.key_type.is_none() {
        errors.push(FieldError::TypeNil);
        return errors;
    }

    if !BASE64_RE.is_match(key_data) {
        errors.push(FieldError::DataChar);
    }
    if key_data.len() < MIN_KEY_DATA_LEN {
        errors.push(FieldError::DataShort);
    }
    if key_data.len() > MAX_KEY_DATA_LEN {
        errors.push(FieldError::DataLong);
    }
    if key_data.len() % 4 != 0 {
        errors.push(FieldError::DataModulus);
    }

    errors
}

/// Validates a record, replacing its error list with the result of this pass
pub fn validate(record: &mut Record) -> bool {
    let errors = check(record);
    let valid = errors.is_empty();
    if !valid {
        trace!("record failed validation with {:?}", errors);
    }
    record.set_errors(errors);
    valid
}
