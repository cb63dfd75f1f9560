//! Management of OpenSSH `authorized_keys` files.
//!
//! Each line of a key file maps to a [`Record`]. A [`Store`] reads and searches those records
//! and writes changes back through [`atomic_lock`], so concurrent writers never lose each
//! others updates and readers never observe a half written file.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![forbid(unsafe_code)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod codec;
pub mod config;
pub mod error;
pub mod fs_lock;
pub mod record;
pub mod store;
pub mod validator;

pub use crate::codec::{parse, render};
pub use crate::config::StoreConfig;
pub use crate::error::{AuthKeysError, FieldError};
pub use crate::fs_lock::{atomic_lock, atomic_lock_if};
pub use crate::record::{Field, FieldKind, FlagValue, Record};
pub use crate::store::Store;
pub use crate::validator::validate;
