//! Field kinds and the `Field` declaration builder.
//!
//! A [`FieldKind`] knows how to turn a raw stream (text for textual kinds,
//! bytes for binary kinds) into a [`Value`] and back, and which checks are
//! intrinsic to the kind. A [`Field`] adds everything declared per item:
//! name, default, secrecy, validators and the services allowed to receive it.
//!
//! Storage encoding:
//!
//! - secret or binary fields are stored as base64 of the stream form
//! - other fields are stored as literal text without line breaks

use crate::config::Config;
use crate::defaults::{default_separator, SECRET_MASK};
use crate::errors::{self, Result};
use crate::services::{ServiceSpec, Services};
use crate::validation::{
    self, CertificateValidator, MaxLength, MinLength, PrivateKeyValidator, ValidationError,
    Validator,
};
use crate::value::{DefaultValue, Value};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

// ============================================================================
// FIELD KINDS
// ============================================================================

/// Conversion and intrinsic checks of one kind of value.
pub trait FieldKind: Send + Sync {
    /// Short kind name, as used in manifests.
    fn kind_name(&self) -> &'static str;

    /// Whether the stream form is arbitrary bytes rather than text.
    fn binary(&self) -> bool {
        false
    }

    /// Whether fields of this kind must be declared secret.
    fn requires_secret(&self) -> bool {
        false
    }

    /// Parse the raw stream form.
    fn from_stream(&self, raw: &[u8]) -> Result<Value>;

    /// Render the raw stream form. Inverse of [`FieldKind::from_stream`].
    fn to_stream(&self, value: &Value) -> Result<Vec<u8>>;

    /// Display form for reports.
    fn human_readable(&self, value: &Value) -> String;

    /// Checks every value of this kind must pass, the type check included.
    fn validate(&self, config: &Config, value: &Value) -> std::result::Result<(), ValidationError>;

    /// Reject kind parameters no value could ever satisfy.
    fn check(&self) -> Result<()> {
        Ok(())
    }

    /// Other fields read while validating a value of this kind.
    fn references(&self) -> Vec<String> {
        Vec::new()
    }
}

fn text(raw: &[u8]) -> Result<&str> {
    std::str::from_utf8(raw).map_err(|_| errors::invalid_value("expected UTF-8 text"))
}

fn wrong_type(expected: &str, value: &Value) -> ValidationError {
    ValidationError::new(format!("Expected {expected}, got {}", value.type_name()))
}

fn type_mismatch(expected: &str, value: &Value) -> crate::ConfError {
    errors::invalid_value(format!("expected {expected}, got {}", value.type_name()))
}

/// Free text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringKind;

impl FieldKind for StringKind {
    fn kind_name(&self) -> &'static str {
        "string"
    }

    fn from_stream(&self, raw: &[u8]) -> Result<Value> {
        Ok(Value::Str(text(raw)?.to_owned()))
    }

    fn to_stream(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::Str(s) => Ok(s.as_bytes().to_vec()),
            other => Err(type_mismatch("string", other)),
        }
    }

    fn human_readable(&self, value: &Value) -> String {
        value.as_str().unwrap_or_default().to_owned()
    }

    fn validate(&self, _config: &Config, value: &Value) -> std::result::Result<(), ValidationError> {
        match value {
            Value::Str(_) => Ok(()),
            other => Err(wrong_type("string", other)),
        }
    }
}

/// Signed 64-bit integer.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerKind;

impl FieldKind for IntegerKind {
    fn kind_name(&self) -> &'static str {
        "integer"
    }

    fn from_stream(&self, raw: &[u8]) -> Result<Value> {
        text(raw)?
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| errors::invalid_value("expected an integer"))
    }

    fn to_stream(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::Int(i) => Ok(i.to_string().into_bytes()),
            other => Err(type_mismatch("integer", other)),
        }
    }

    fn human_readable(&self, value: &Value) -> String {
        value.as_int().map(|i| i.to_string()).unwrap_or_default()
    }

    fn validate(&self, _config: &Config, value: &Value) -> std::result::Result<(), ValidationError> {
        match value {
            Value::Int(_) => Ok(()),
            other => Err(wrong_type("integer", other)),
        }
    }
}

/// `true`/`false`; also accepts `1`/`0`, `yes`/`no`, `on`/`off`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanKind;

impl FieldKind for BooleanKind {
    fn kind_name(&self) -> &'static str {
        "boolean"
    }

    fn from_stream(&self, raw: &[u8]) -> Result<Value> {
        match text(raw)?.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
            _ => Err(errors::invalid_value("expected a boolean")),
        }
    }

    fn to_stream(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::Bool(b) => Ok(b.to_string().into_bytes()),
            other => Err(type_mismatch("boolean", other)),
        }
    }

    fn human_readable(&self, value: &Value) -> String {
        value.as_bool().map(|b| b.to_string()).unwrap_or_default()
    }

    fn validate(&self, _config: &Config, value: &Value) -> std::result::Result<(), ValidationError> {
        match value {
            Value::Bool(_) => Ok(()),
            other => Err(wrong_type("boolean", other)),
        }
    }
}

/// Arbitrary file contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileKind;

fn bytes_to_stream(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        other => Err(type_mismatch("bytes", other)),
    }
}

fn check_bytes(value: &Value) -> std::result::Result<(), ValidationError> {
    match value {
        Value::Bytes(_) => Ok(()),
        other => Err(wrong_type("bytes", other)),
    }
}

impl FieldKind for FileKind {
    fn kind_name(&self) -> &'static str {
        "file"
    }

    fn binary(&self) -> bool {
        true
    }

    fn from_stream(&self, raw: &[u8]) -> Result<Value> {
        Ok(Value::Bytes(raw.to_vec()))
    }

    fn to_stream(&self, value: &Value) -> Result<Vec<u8>> {
        bytes_to_stream(value)
    }

    fn human_readable(&self, value: &Value) -> String {
        format!("File of size {} bytes", value.length().unwrap_or(0))
    }

    fn validate(&self, _config: &Config, value: &Value) -> std::result::Result<(), ValidationError> {
        check_bytes(value)
    }
}

/// Mailbox written as `addr` or `Display Name <addr>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailKind;

fn mailbox_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(.*?)\s*<([^<>]*)>\s*$").expect("mailbox pattern is a valid regex"))
}

impl FieldKind for EmailKind {
    fn kind_name(&self) -> &'static str {
        "email"
    }

    fn from_stream(&self, raw: &[u8]) -> Result<Value> {
        let s = text(raw)?;
        if let Some(caps) = mailbox_regex().captures(s) {
            let name = caps.get(1).map_or("", |m| m.as_str());
            let address = caps.get(2).map_or("", |m| m.as_str()).trim();
            return Ok(Value::Email {
                name: name.to_owned(),
                address: address.to_owned(),
            });
        }
        Ok(Value::email(s.trim()))
    }

    fn to_stream(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::Email { name, address } if name.is_empty() => Ok(address.as_bytes().to_vec()),
            Value::Email { name, address } => Ok(format!("{name} <{address}>").into_bytes()),
            other => Err(type_mismatch("email", other)),
        }
    }

    fn human_readable(&self, value: &Value) -> String {
        self.to_stream(value)
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
            .unwrap_or_default()
    }

    fn validate(&self, config: &Config, value: &Value) -> std::result::Result<(), ValidationError> {
        match value {
            Value::Email { .. } => validation::EmailAddress.validate(config, value),
            other => Err(wrong_type("email", other)),
        }
    }
}

/// PEM or DER private key, checked with `openssl pkey`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivateKeyKind;

impl FieldKind for PrivateKeyKind {
    fn kind_name(&self) -> &'static str {
        "private_key"
    }

    fn binary(&self) -> bool {
        true
    }

    fn requires_secret(&self) -> bool {
        true
    }

    fn from_stream(&self, raw: &[u8]) -> Result<Value> {
        Ok(Value::Bytes(raw.to_vec()))
    }

    fn to_stream(&self, value: &Value) -> Result<Vec<u8>> {
        bytes_to_stream(value)
    }

    fn human_readable(&self, value: &Value) -> String {
        format!("SSL private key file of size {} bytes", value.length().unwrap_or(0))
    }

    fn validate(&self, config: &Config, value: &Value) -> std::result::Result<(), ValidationError> {
        check_bytes(value)?;
        PrivateKeyValidator.validate(config, value)
    }
}

/// X.509 certificate, checked with `openssl verify`.
#[derive(Default)]
pub struct CertificateKind {
    validator: CertificateValidator,
}

impl CertificateKind {
    /// Certificate kind with the given verification rules.
    #[must_use]
    pub fn new(validator: CertificateValidator) -> Self {
        Self { validator }
    }
}

impl FieldKind for CertificateKind {
    fn kind_name(&self) -> &'static str {
        "certificate"
    }

    fn binary(&self) -> bool {
        true
    }

    fn from_stream(&self, raw: &[u8]) -> Result<Value> {
        Ok(Value::Bytes(raw.to_vec()))
    }

    fn to_stream(&self, value: &Value) -> Result<Vec<u8>> {
        bytes_to_stream(value)
    }

    fn human_readable(&self, value: &Value) -> String {
        format!("SSL certificate file of size {} bytes", value.length().unwrap_or(0))
    }

    fn validate(&self, config: &Config, value: &Value) -> std::result::Result<(), ValidationError> {
        check_bytes(value)?;
        self.validator.validate(config, value)
    }

    fn references(&self) -> Vec<String> {
        self.validator.referenced_fields().to_vec()
    }
}

/// Separator-joined list of an inner textual kind.
pub struct ListKind {
    item: Box<dyn FieldKind>,
    item_validators: Vec<Box<dyn Validator>>,
    separator: String,
    min_items: Option<usize>,
    max_items: Option<usize>,
}

impl ListKind {
    /// List of `item`, comma separated, unbounded.
    #[must_use]
    pub fn new(item: impl FieldKind + 'static) -> Self {
        Self::boxed(Box::new(item))
    }

    pub(crate) fn boxed(item: Box<dyn FieldKind>) -> Self {
        Self {
            item,
            item_validators: Vec::new(),
            separator: default_separator(),
            min_items: None,
            max_items: None,
        }
    }

    /// Item separator in the stream form.
    #[must_use]
    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Fewest items accepted.
    #[must_use]
    pub fn min_items(mut self, n: usize) -> Self {
        self.min_items = Some(n);
        self
    }

    /// Most items accepted.
    #[must_use]
    pub fn max_items(mut self, n: usize) -> Self {
        self.max_items = Some(n);
        self
    }

    /// Validator run against every item.
    #[must_use]
    pub fn item_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.item_validators.push(Box::new(validator));
        self
    }

    pub(crate) fn boxed_item_validator(mut self, validator: Box<dyn Validator>) -> Self {
        self.item_validators.push(validator);
        self
    }
}

impl FieldKind for ListKind {
    fn kind_name(&self) -> &'static str {
        "list"
    }

    fn from_stream(&self, raw: &[u8]) -> Result<Value> {
        let s = text(raw)?;
        if s.is_empty() {
            return Ok(Value::List(Vec::new()));
        }
        s.split(self.separator.as_str())
            .map(|part| {
                if part.is_empty() {
                    return Err(errors::invalid_value("list items can not be empty"));
                }
                self.item.from_stream(part.as_bytes())
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::List)
    }

    fn to_stream(&self, value: &Value) -> Result<Vec<u8>> {
        let Value::List(items) = value else {
            return Err(type_mismatch("list", value));
        };
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            let part = String::from_utf8(self.item.to_stream(item)?)
                .map_err(|_| errors::invalid_value("list items must be text"))?;
            if part.is_empty() {
                return Err(errors::invalid_value("list items can not be empty"));
            }
            if part.contains(self.separator.as_str()) {
                return Err(errors::invalid_value("list item contains the separator"));
            }
            parts.push(part);
        }
        Ok(parts.join(&self.separator).into_bytes())
    }

    fn check(&self) -> Result<()> {
        if self.separator.is_empty() {
            return Err(errors::improperly_configured(
                "declare_field",
                "list separator can not be empty",
            ));
        }
        self.item.check()
    }

    fn references(&self) -> Vec<String> {
        self.item.references()
    }

    fn human_readable(&self, value: &Value) -> String {
        let items = value.as_list().unwrap_or_default();
        let rendered: Vec<String> = items.iter().map(|i| self.item.human_readable(i)).collect();
        format!("[{}]", rendered.join(", "))
    }

    fn validate(&self, config: &Config, value: &Value) -> std::result::Result<(), ValidationError> {
        let Value::List(items) = value else {
            return Err(wrong_type("list", value));
        };
        let mut errors = ValidationError::empty();
        if let Some(min) = self.min_items {
            if items.len() < min {
                errors.push(format!("Too few items ({} < {min})", items.len()));
            }
        }
        if let Some(max) = self.max_items {
            if items.len() > max {
                errors.push(format!("Too many items ({} > {max})", items.len()));
            }
        }
        for (index, item) in items.iter().enumerate() {
            let mut item_errors = ValidationError::empty();
            if let Err(e) = self.item.validate(config, item) {
                item_errors.merge(e);
            }
            if let Err(e) = validation::run_all(&self.item_validators, config, item) {
                item_errors.merge(e);
            }
            errors.push_item(index, item_errors);
        }
        errors.into_result()
    }
}

// ============================================================================
// FIELD
// ============================================================================

/// One declared configuration item.
pub struct Field {
    name: String,
    kind: Box<dyn FieldKind>,
    default: DefaultValue,
    help: Option<String>,
    secret: bool,
    validators: Vec<Box<dyn Validator>>,
    services: Services,
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("kind", &self.kind.kind_name())
            .field("secret", &self.secret)
            .field("validators", &self.validators.len())
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Field {
    /// Field of an arbitrary kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl FieldKind + 'static) -> Self {
        Self::with_kind(name, Box::new(kind))
    }

    pub(crate) fn with_kind(name: impl Into<String>, kind: Box<dyn FieldKind>) -> Self {
        let secret = kind.requires_secret();
        Self {
            name: name.into(),
            kind,
            default: DefaultValue::Unset,
            help: None,
            secret,
            validators: Vec::new(),
            services: Services::new(),
        }
    }

    /// Text field.
    #[must_use]
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, StringKind)
    }

    /// Integer field.
    #[must_use]
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, IntegerKind)
    }

    /// Boolean field.
    #[must_use]
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, BooleanKind)
    }

    /// File contents field.
    #[must_use]
    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, FileKind)
    }

    /// Mailbox field.
    #[must_use]
    pub fn email(name: impl Into<String>) -> Self {
        Self::new(name, EmailKind)
    }

    /// Private key field. Always secret.
    #[must_use]
    pub fn private_key(name: impl Into<String>) -> Self {
        Self::new(name, PrivateKeyKind)
    }

    /// Certificate field with the given verification rules.
    #[must_use]
    pub fn certificate(name: impl Into<String>, validator: CertificateValidator) -> Self {
        Self::new(name, CertificateKind::new(validator))
    }

    /// List field.
    #[must_use]
    pub fn list(name: impl Into<String>, kind: ListKind) -> Self {
        Self::new(name, kind)
    }

    /// Comma separated list of strings.
    #[must_use]
    pub fn string_list(name: impl Into<String>) -> Self {
        Self::list(name, ListKind::new(StringKind))
    }

    /// Comma separated list of integers.
    #[must_use]
    pub fn integer_list(name: impl Into<String>) -> Self {
        Self::list(name, ListKind::new(IntegerKind))
    }

    /// Mark as secret.
    #[must_use]
    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub(crate) fn set_secret(mut self, secret: bool) -> Self {
        self.secret = secret;
        self
    }

    /// Value returned while nothing is stored.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = DefaultValue::Value(value.into());
        self
    }

    /// Help text shown in reports.
    #[must_use]
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add a validator.
    #[must_use]
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Add an already boxed validator.
    #[must_use]
    pub fn boxed_validator(mut self, validator: Box<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Shorthand for a [`MinLength`] validator.
    #[must_use]
    pub fn min_length(self, n: usize) -> Self {
        self.validator(MinLength(n))
    }

    /// Shorthand for a [`MaxLength`] validator.
    #[must_use]
    pub fn max_length(self, n: usize) -> Self {
        self.validator(MaxLength(n))
    }

    /// Allow `service` to receive this secret with the given placement.
    #[must_use]
    pub fn service(mut self, service: impl Into<String>, spec: ServiceSpec) -> Self {
        self.services.insert(service.into(), spec);
        self
    }

    /// Replace the whole service map.
    #[must_use]
    pub fn services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Globally unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of the field.
    #[must_use]
    pub fn kind(&self) -> &dyn FieldKind {
        self.kind.as_ref()
    }

    /// Whether the field is secret.
    #[must_use]
    pub fn is_secret(&self) -> bool {
        self.secret
    }

    /// Declared default.
    #[must_use]
    pub fn default_value(&self) -> &DefaultValue {
        &self.default
    }

    /// Help text.
    #[must_use]
    pub fn help_text(&self) -> Option<&str> {
        self.help.as_deref()
    }

    /// Services allowed to receive the value.
    #[must_use]
    pub fn service_specs(&self) -> &Services {
        &self.services
    }

    // ------------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------------

    fn base64_stored(&self) -> bool {
        self.secret || self.kind.binary()
    }

    /// Storage string: base64 for secret or binary fields, literal otherwise.
    pub fn to_storage(&self, value: &Value) -> Result<String> {
        let stream = self.kind.to_stream(value)?;
        if self.base64_stored() {
            return Ok(STANDARD.encode(stream));
        }
        let text = String::from_utf8(stream)
            .map_err(|_| errors::invalid_value("textual value is not valid UTF-8"))?;
        if text.contains(['\n', '\r']) {
            return Err(errors::invalid_value("value can not contain line breaks"));
        }
        Ok(text)
    }

    /// Inverse of [`Field::to_storage`].
    pub fn from_storage(&self, stored: &str) -> Result<Value> {
        if self.base64_stored() {
            let raw = STANDARD
                .decode(stored.trim())
                .map_err(|_| errors::invalid_value("stored value is not valid base64"))?;
            return self.kind.from_stream(&raw);
        }
        self.kind.from_stream(stored.as_bytes())
    }

    /// Bytes handed to a storage backend.
    ///
    /// Secret fields go to backends that take raw stream bytes (the secret
    /// file adds its own base64 layer); the others go to text backends.
    pub(crate) fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        if self.secret {
            self.kind.to_stream(value)
        } else {
            self.to_storage(value).map(String::into_bytes)
        }
    }

    /// Inverse of [`Field::encode`].
    pub(crate) fn decode(&self, raw: &[u8]) -> Result<Value> {
        if self.secret {
            self.kind.from_stream(raw)
        } else {
            self.from_storage(text(raw)?)
        }
    }

    // ------------------------------------------------------------------------
    // Validation and rendering
    // ------------------------------------------------------------------------

    /// Run the kind's checks and every declared validator, collecting all
    /// failures.
    pub fn validate(&self, config: &Config, value: &Value) -> std::result::Result<(), ValidationError> {
        let mut errors = ValidationError::empty();
        if let Err(e) = self.kind.validate(config, value) {
            errors.merge(e);
        }
        if let Err(e) = validation::run_all(&self.validators, config, value) {
            errors.merge(e);
        }
        errors.into_result()
    }

    /// Display form of `value`. Secret fields always render as a mask.
    #[must_use]
    pub fn reportable(&self, value: &Value) -> String {
        if self.secret {
            SECRET_MASK.to_owned()
        } else {
            self.kind.human_readable(value)
        }
    }

    /// Structural checks performed once when the registry is built.
    pub(crate) fn check(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(['=', '/', '#', '\0']) || self.name.contains(char::is_whitespace) {
            return Err(errors::improperly_configured(
                "declare_field",
                format!("invalid field name {:?}", self.name),
            ));
        }
        self.kind.check()?;
        if self.kind.requires_secret() && !self.secret {
            return Err(errors::improperly_configured(
                "declare_field",
                format!("{} fields must be secret ({})", self.kind.kind_name(), self.name),
            ));
        }
        if !self.secret && !self.services.is_empty() {
            return Err(errors::improperly_configured(
                "declare_field",
                format!("services can only be declared on secret fields ({})", self.name),
            ));
        }
        if let DefaultValue::Value(v) = &self.default {
            self.kind.to_stream(v).map_err(|_| {
                errors::improperly_configured(
                    "declare_field",
                    format!("default of {} does not match its kind", self.name),
                )
            })?;
        }
        Ok(())
    }
}
