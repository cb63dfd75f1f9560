//! `authkeys`, a small tool for inspecting and editing an authorized_keys file from scripts.
//! Every change goes through the same locked, atomic rewrite the library uses so it is safe
//! to run alongside anything else that manages the same file.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![forbid(unsafe_code)]

#[macro_use]
extern crate log;

use auth_keys::{AuthKeysError, Field, Record, Store, StoreConfig};
use clap::{Parser, Subcommand};
use env_logger::Env;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(name = "authkeys", version, about = "Manage an OpenSSH authorized_keys file")]
struct Args {
    /// Toml file describing the key file, see `StoreConfig`
    #[arg(short, long, conflicts_with = "file")]
    config: Option<PathBuf>,
    /// The authorized_keys file to operate on
    #[arg(short, long)]
    file: Option<PathBuf>,
    /// Lock file to use instead of `<file>.lockfile`
    #[arg(long)]
    lock_file: Option<PathBuf>,
    /// Directory for temporary files, must be on the same filesystem as the key file
    #[arg(long)]
    temp_dir: Option<PathBuf>,
    /// Log everything
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every key in the file
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print the keys matching every given field=value pair
    Find {
        #[arg(required = true, value_name = "FIELD=VALUE")]
        filters: Vec<String>,
        /// Treat each value as a regular expression
        #[arg(long)]
        regex: bool,
        #[arg(long)]
        json: bool,
    },
    /// Add a key line, replacing any line with the same key data
    Add { line: String },
    /// Change fields of an existing key, an empty value clears the field
    Set {
        key_data: String,
        #[arg(required = true, value_name = "FIELD=VALUE")]
        fields: Vec<String>,
    },
    /// Remove the key with this key data
    Remove { key_data: String },
}

fn main() {
    let args = Args::parse();
    let default_filter = if args.verbose { "trace" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    if let Err(e) = run(args) {
        error!("{}", e);
        process::exit(1);
    }
}

fn store_config(args: &Args) -> Result<StoreConfig, AuthKeysError> {
    let mut config = match (&args.config, &args.file) {
        (Some(config), _) => StoreConfig::load(config)?,
        (None, Some(file)) => StoreConfig::new(file),
        (None, None) => {
            return Err(AuthKeysError::ConfigError(
                "one of --config or --file is required".to_string(),
            ))
        }
    };
    if let Some(lock_file) = &args.lock_file {
        config.lock_path = Some(lock_file.clone());
    }
    if let Some(temp_dir) = &args.temp_dir {
        config.temp_dir = Some(temp_dir.clone());
    }
    Ok(config)
}

/// Splits `field=value` at the first `=`, the value may itself contain `=`
fn parse_assignment(assignment: &str) -> Result<(Field, String), AuthKeysError> {
    let (name, value) = assignment.split_once('=').ok_or_else(|| {
        AuthKeysError::ConfigError(format!("expected field=value, got {assignment}"))
    })?;
    let field = name.parse::<Field>().map_err(AuthKeysError::ConfigError)?;
    Ok((field, value.to_string()))
}

fn print_records(records: &[Record], json: bool) -> Result<(), AuthKeysError> {
    for record in records.iter().filter(|r| r.is_complete()) {
        if json {
            let out = serde_json::to_string(record).map_err(std::io::Error::from)?;
            println!("{out}");
        } else {
            match auth_keys::render(record) {
                Some(line) => println!("{line}"),
                // keep showing lines we could read but would not write
                None => println!("{}", record.raw_line().unwrap_or_default()),
            }
        }
    }
    Ok(())
}

fn save(store: &Store, record: &mut Record) -> Result<(), AuthKeysError> {
    let res = store.save_or_raise(record);
    if res.is_err() {
        for e in record.errors() {
            error!("{}", e);
        }
    }
    res
}

fn run(args: Args) -> Result<(), AuthKeysError> {
    let store = Store::from_config(store_config(&args)?);

    match args.command {
        Command::List { json } => print_records(&store.all()?, json),
        Command::Find {
            filters,
            regex,
            json,
        } => {
            let filters = filters
                .iter()
                .map(|f| parse_assignment(f))
                .collect::<Result<Vec<_>, _>>()?;
            print_records(&store.find_all_by(&filters, regex)?, json)
        }
        Command::Add { line } => {
            let mut record = Record::parse(&line);
            save(&store, &mut record)
        }
        Command::Set { key_data, fields } => {
            let mut record = store.find_by_key_data(&key_data)?.ok_or_else(|| {
                AuthKeysError::RecordInvalid(format!("no key with key data {key_data}"))
            })?;
            for assignment in fields {
                let (field, value) = parse_assignment(&assignment)?;
                if field == Field::KeyData {
                    return Err(AuthKeysError::RecordInvalid(
                        "key data identifies the record and can not be changed".to_string(),
                    ));
                }
                if value.is_empty() {
                    record.clear_field(field);
                } else {
                    record.set_field(field, &value);
                }
            }
            save(&store, &mut record)
        }
        Command::Remove { key_data } => {
            let record = store.find_by_key_data(&key_data)?.ok_or_else(|| {
                AuthKeysError::RecordInvalid(format!("no key with key data {key_data}"))
            })?;
            store.destroy(&record)?;
            Ok(())
        }
    }
}
