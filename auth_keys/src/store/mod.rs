//! The key file as a collection of records.
//!
//! Listing and searching read the file without taking the lock, so a reader racing a writer
//! sees either the file from before or after the write (never a partial one) but may well
//! see the older of the two. Every change goes through [`atomic_lock`] which serializes
//! writers and publishes the new file with a rename.

use crate::codec;
use crate::config::StoreConfig;
use crate::error::AuthKeysError as Error;
use crate::fs_lock::atomic_lock_if;
use crate::record::{Field, Record};
use regex::Regex;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(test)]
mod tests;

/// What to do with the line whose key data matches the record being written
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WriteMode {
    /// replace it, leave the file alone if there is none
    Update,
    /// replace it, or append a new line if there is none
    Upsert,
    /// drop it
    Destroy,
}

/// An authorized_keys file
#[derive(Debug, Clone)]
pub struct Store {
    config: StoreConfig,
}

impl Store {
    /// A store for `path` using the default lock file next to it
    pub fn new(path: impl Into<PathBuf>) -> Store {
        Store::from_config(StoreConfig::new(path))
    }

    pub fn with_lock_path(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Store {
        let mut config = StoreConfig::new(path);
        config.lock_path = Some(lock_path.into());
        Store::from_config(config)
    }

    pub fn from_config(config: StoreConfig) -> Store {
        Store { config }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn lock_path(&self) -> PathBuf {
        self.config.lock_path()
    }

    /// Every line of the file as a record, including blank and comment lines which come
    /// back incomplete. A file that does not exist yet holds no records
    pub fn all(&self) -> Result<Vec<Record>, Error> {
        let contents = match fs::read(self.path()) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} does not exist, no keys", self.path().display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(lines(&contents)
            .map(|line| {
                let mut record = parse_bytes(line);
                record.set_saved(true);
                record
            })
            .collect())
    }

    /// Records where every given field matches its value. Without `with_regex` a field
    /// matches when its text form equals the value, with it the value is a pattern searched
    /// for in the text form (an unset field is searched as the empty string)
    pub fn find_all_by<S: AsRef<str>>(
        &self,
        fields: &[(Field, S)],
        with_regex: bool,
    ) -> Result<Vec<Record>, Error> {
        let patterns = if with_regex {
            fields
                .iter()
                .map(|(_, value)| Regex::new(value.as_ref()))
                .collect::<Result<Vec<Regex>, regex::Error>>()?
        } else {
            Vec::new()
        };

        Ok(self
            .all()?
            .into_iter()
            .filter(|record| {
                fields.iter().enumerate().all(|(i, (field, value))| {
                    let current = record.field_value(*field);
                    if with_regex {
                        patterns[i].is_match(current.as_deref().unwrap_or(""))
                    } else {
                        current.as_deref() == Some(value.as_ref())
                    }
                })
            })
            .collect())
    }

    /// The record holding this key data, if any
    pub fn find_by_key_data(&self, key_data: &str) -> Result<Option<Record>, Error> {
        Ok(self
            .find_all_by(&[(Field::KeyData, key_data)], false)?
            .into_iter()
            .next())
    }

    /// Replaces the line with the same key data as `record` by the rendered record, or
    /// removes it when `destroy` is set. Lines with other key data are written back
    /// untouched. Returns whether a matching line was found, no line is added when there
    /// was none. The record is not validated here, an unrenderable record is refused
    pub fn write(&self, record: &Record, destroy: bool) -> Result<bool, Error> {
        let mode = if destroy {
            WriteMode::Destroy
        } else {
            WriteMode::Update
        };
        self.rewrite(record, mode)
    }

    /// Removes the line with the same key data as `record`
    pub fn destroy(&self, record: &Record) -> Result<bool, Error> {
        self.write(record, true)
    }

    /// Validates the record and writes it, replacing the line with the same key data or
    /// appending a new line. Returns false when the record does not validate, the reasons
    /// are left in [`Record::errors`]
    pub fn save(&self, record: &mut Record) -> Result<bool, Error> {
        if !record.validate() {
            return Ok(false);
        }
        let line = match codec::render(record) {
            Some(line) => line,
            None => {
                warn!("refusing to save a record that does not fit on one line");
                return Ok(false);
            }
        };
        self.rewrite(record, WriteMode::Upsert)?;
        record.set_raw_line(line);
        record.set_saved(true);
        Ok(true)
    }

    /// Like [`Store::save`] but a record that fails validation is an error
    pub fn save_or_raise(&self, record: &mut Record) -> Result<(), Error> {
        if self.save(record)? {
            Ok(())
        } else {
            Err(Error::RecordInvalid("Errors preventing save".to_string()))
        }
    }

    /// Removes a record previously loaded from or saved to this file. Records that were
    /// never saved, or no longer validate, are left alone and false is returned
    pub fn remove(&self, record: &mut Record) -> Result<bool, Error> {
        if !record.is_saved() {
            return Ok(false);
        }
        let removed = self.destroy(record)?;
        record.set_saved(false);
        Ok(removed)
    }

    fn rewrite(&self, record: &Record, mode: WriteMode) -> Result<bool, Error> {
        let key_data = match &record.key_data {
            Some(key_data) => key_data.clone(),
            None => {
                warn!("can not locate a record without key data");
                return Ok(false);
            }
        };
        let replacement = match mode {
            WriteMode::Destroy => None,
            WriteMode::Update | WriteMode::Upsert => match codec::render(record) {
                Some(line) => Some(line),
                None => {
                    return Err(Error::RecordInvalid(format!(
                        "record with key data {key_data} can not be written"
                    )))
                }
            },
        };

        let temp_dir = self.config.temp_dir.as_deref();
        atomic_lock_if(self.path(), &self.lock_path(), temp_dir, |file| {
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)?;

            let mut output = Vec::with_capacity(contents.len());
            let mut matched = false;
            for line in lines(&contents) {
                let existing = parse_bytes(line);
                if existing.key_data.as_deref() != Some(key_data.as_str()) {
                    output.extend_from_slice(line);
                    continue;
                }
                matched = true;
                if let Some(new_line) = &replacement {
                    output.extend_from_slice(new_line.as_bytes());
                    output.push(b'\n');
                }
            }

            let append = !matched && mode == WriteMode::Upsert;
            if !matched && !append {
                debug!("no line holds key {}", key_data);
                return Ok((false, false));
            }
            if let (true, Some(new_line)) = (append, &replacement) {
                if output.last().map_or(false, |b| *b != b'\n') {
                    output.push(b'\n');
                }
                output.extend_from_slice(new_line.as_bytes());
                output.push(b'\n');
            }

            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&output)?;

            match mode {
                WriteMode::Destroy => info!("removed key {}", key_data),
                _ if append => info!("added key {}", key_data),
                _ => info!("updated key {}", key_data),
            }
            Ok((matched, true))
        })
    }
}

/// Lines of the file with their terminators, a missing final newline still ends a line
fn lines(contents: &[u8]) -> impl Iterator<Item = &[u8]> {
    contents.split_inclusive(|b| *b == b'\n')
}

/// Lines are parsed for their fields only, bytes that are not UTF-8 never end up in key
/// data so a lossy conversion is enough to tell which record a line holds
fn parse_bytes(line: &[u8]) -> Record {
    codec::parse(&String::from_utf8_lossy(line))
}
