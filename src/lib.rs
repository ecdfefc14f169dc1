//! # stackconf
//!
//! **Typed configuration fields and least-privilege secret provisioning for
//! containerized service stacks.**
//!
//! Operators set values once in two admin files on the host. Services read
//! their plain settings from the environment and receive only the secrets
//! they are listed for, as individual files with the owner and mode
//! declared for them.
//!
//! # Core Properties
//!
//! - **Typed fields**: every value is parsed and validated by its kind
//! - **Aggregate validation**: all failures of a value are reported at once
//! - **Least privilege**: a secret reaches only the services that list it
//! - **Crash-safe files**: admin files are rewritten via temp file and rename
//! - **No leaks**: errors, logs and `Debug` output never contain values
//!
//! # Example
//!
//! ```no_run
//! use stackconf::{Config, Field, Section, ServiceSpec};
//!
//! let config = Config::builder()
//!     .section(
//!         Section::new("Database")
//!             .field(Field::string("DB_NAME").default("app"))
//!             .field(
//!                 Field::string("DB_PASSWORD")
//!                     .secret()
//!                     .min_length(12)
//!                     .service("postgres", ServiceSpec::new().uid(999u32)),
//!             ),
//!     )
//!     .build()?;
//!
//! config.set("DB_PASSWORD", "correct horse battery")?;
//! config.prepare("postgres")?;
//! # Ok::<(), stackconf::ConfError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::unwrap_used)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

// Core modules
mod config;
mod defaults;
mod errors;
mod fields;
mod inspect;
mod services;
mod value;

pub mod encryption;
pub mod environment;
pub mod manifest;
pub mod storage;
pub mod validation;

// Re-export core types for public API
pub use config::{Config, ConfigBuilder, CrossValidator, Section};
pub use defaults::{
    DEFAULT_KDF_ITERATIONS, ENV_FILE_VAR, MAX_PASSWORD_ATTEMPTS, SECRET_DIR_VAR, SECRET_FILE_VAR,
    SECRET_MASK, THEME_VAR,
};
pub use encryption::Password;
pub use environment::{Environment, MemoryEnv, ProcessEnv};
pub use errors::{ConfError, Result};
pub use fields::{
    BooleanKind, CertificateKind, EmailKind, Field, FieldKind, FileKind, IntegerKind, ListKind,
    PrivateKeyKind, StringKind,
};
pub use inspect::{
    AdminFile, CrossCheck, FieldReport, Report, SectionReport, StaleEntry, StaleReason, Status,
    Theme,
};
pub use services::{Owner, Placement, ServiceSpec, Services};
pub use validation::{ValidationError, Validator};
pub use value::{DefaultValue, Value};
