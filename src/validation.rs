//! Validators and the aggregate validation error.
//!
//! Validators never short-circuit each other: a field runs every validator
//! and reports every failure at once.

use crate::config::Config;
use crate::value::{DefaultValue, Value};
use regex::Regex;
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use tracing::debug;

/// Composite validation error.
///
/// Carries flat messages and, for list values, per-item errors keyed by the
/// item's position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    messages: Vec<String>,
    items: Vec<(usize, ValidationError)>,
}

impl ValidationError {
    /// Error with a single message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
            items: Vec::new(),
        }
    }

    /// Empty accumulator.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.items.iter().all(|(_, e)| e.is_empty())
    }

    /// Number of elementary messages, nested ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len() + self.items.iter().map(|(_, e)| e.len()).sum::<usize>()
    }

    /// Record one more message.
    pub fn push(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Fold another error's messages and items into this one.
    pub fn merge(&mut self, other: ValidationError) {
        self.messages.extend(other.messages);
        self.items.extend(other.items);
    }

    /// Record the failure of the list item at `index`.
    pub fn push_item(&mut self, index: usize, error: ValidationError) {
        if !error.is_empty() {
            self.items.push((index, error));
        }
    }

    /// Messages recorded directly on this error.
    #[must_use]
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Per-item errors of a list value.
    #[must_use]
    pub fn items(&self) -> &[(usize, ValidationError)] {
        &self.items
    }

    /// Every elementary message, nested ones prefixed with their item index.
    #[must_use]
    pub fn flatten(&self) -> Vec<String> {
        let mut out = self.messages.clone();
        for (index, err) in &self.items {
            out.extend(err.flatten().into_iter().map(|m| format!("item {index}: {m}")));
        }
        out
    }

    /// `Ok(())` when empty, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flatten().join("; "))
    }
}

impl std::error::Error for ValidationError {}

/// A single validation rule.
///
/// Validators receive the whole configuration so rules can consult other
/// fields (e.g. a certificate checked against a CA stored elsewhere).
pub trait Validator: Send + Sync {
    /// Check `value`; return every problem found.
    fn validate(&self, config: &Config, value: &Value) -> Result<(), ValidationError>;
}

/// Run every validator against `value`, collecting all failures.
pub fn run_all(
    validators: &[Box<dyn Validator>],
    config: &Config,
    value: &Value,
) -> Result<(), ValidationError> {
    let mut errors = ValidationError::empty();
    for validator in validators {
        if let Err(err) = validator.validate(config, value) {
            errors.merge(err);
        }
    }
    errors.into_result()
}

/// Validator built from a closure.
pub struct FnValidator<F>(pub F);

impl<F> Validator for FnValidator<F>
where
    F: Fn(&Config, &Value) -> Result<(), ValidationError> + Send + Sync,
{
    fn validate(&self, config: &Config, value: &Value) -> Result<(), ValidationError> {
        (self.0)(config, value)
    }
}

/// Box a closure as a validator.
pub fn validator_fn<F>(f: F) -> Box<dyn Validator>
where
    F: Fn(&Config, &Value) -> Result<(), ValidationError> + Send + Sync + 'static,
{
    Box::new(FnValidator(f))
}

// ============================================================================
// BUILT-IN VALIDATORS
// ============================================================================

/// Minimum length for text (chars) and binary (bytes) values.
#[derive(Debug, Clone, Copy)]
pub struct MinLength(pub usize);

impl Validator for MinLength {
    fn validate(&self, _config: &Config, value: &Value) -> Result<(), ValidationError> {
        match value.length() {
            Some(len) if len < self.0 => Err(ValidationError::new(format!(
                "Too short ({len} < {})",
                self.0
            ))),
            _ => Ok(()),
        }
    }
}

/// Maximum length for text (chars) and binary (bytes) values.
#[derive(Debug, Clone, Copy)]
pub struct MaxLength(pub usize);

impl Validator for MaxLength {
    fn validate(&self, _config: &Config, value: &Value) -> Result<(), ValidationError> {
        match value.length() {
            Some(len) if len > self.0 => Err(ValidationError::new(format!(
                "Too long ({len} > {})",
                self.0
            ))),
            _ => Ok(()),
        }
    }
}

/// Inclusive bounds for integer values.
#[derive(Debug, Clone, Copy)]
pub struct IntRange {
    /// Lowest accepted value.
    pub min: Option<i64>,
    /// Highest accepted value.
    pub max: Option<i64>,
}

impl Validator for IntRange {
    fn validate(&self, _config: &Config, value: &Value) -> Result<(), ValidationError> {
        let Some(i) = value.as_int() else {
            return Ok(());
        };
        let mut errors = ValidationError::empty();
        if let Some(min) = self.min {
            if i < min {
                errors.push(format!("Below minimum {min}"));
            }
        }
        if let Some(max) = self.max {
            if i > max {
                errors.push(format!("Above maximum {max}"));
            }
        }
        errors.into_result()
    }
}

/// Rejects text containing uppercase characters.
#[derive(Debug, Clone, Copy)]
pub struct LowercaseOnly;

impl Validator for LowercaseOnly {
    fn validate(&self, _config: &Config, value: &Value) -> Result<(), ValidationError> {
        match value.as_str() {
            Some(s) if s.chars().any(char::is_uppercase) => {
                Err(ValidationError::new("Only lowercase characters are allowed"))
            }
            _ => Ok(()),
        }
    }
}

fn hostname_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?i)[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*$")
            .expect("hostname pattern is a valid regex")
    })
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[^@\s<>]+@[^@\s<>]+$").expect("email pattern is a valid regex")
    })
}

/// RFC 1123 host name check for text values.
#[derive(Debug, Clone, Copy)]
pub struct HostName;

impl Validator for HostName {
    fn validate(&self, _config: &Config, value: &Value) -> Result<(), ValidationError> {
        match value.as_str() {
            Some(s) if s.len() > 253 || !hostname_regex().is_match(s) => {
                Err(ValidationError::new("Not a valid host name"))
            }
            _ => Ok(()),
        }
    }
}

/// Address shape check for email values.
#[derive(Debug, Clone, Copy)]
pub struct EmailAddress;

impl Validator for EmailAddress {
    fn validate(&self, _config: &Config, value: &Value) -> Result<(), ValidationError> {
        match value {
            Value::Email { address, .. } if !email_regex().is_match(address) => {
                Err(ValidationError::new("Not a valid email address"))
            }
            _ => Ok(()),
        }
    }
}

// ============================================================================
// EXTERNAL TOOLCHAIN VALIDATORS
// ============================================================================

/// Run `openssl` with `input` on stdin. Any failure becomes a validation error.
fn run_openssl(args: &[&str], input: &[u8], failure: &str) -> Result<(), ValidationError> {
    let program = which::which("openssl")
        .map_err(|_| ValidationError::new("openssl is not available for validation"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|_| ValidationError::new(failure))?;

    if let Some(mut stdin) = child.stdin.take() {
        // A broken pipe means openssl gave up early; the exit status decides.
        let _ = stdin.write_all(input);
    }

    let status = child.wait().map_err(|_| ValidationError::new(failure))?;
    if status.success() {
        Ok(())
    } else {
        debug!(tool = "openssl", subcommand = ?args.first(), code = ?status.code(), "external validation rejected value");
        Err(ValidationError::new(failure))
    }
}

/// Checks that binary values parse as a private key.
#[derive(Debug, Clone, Copy)]
pub struct PrivateKeyValidator;

impl Validator for PrivateKeyValidator {
    fn validate(&self, _config: &Config, value: &Value) -> Result<(), ValidationError> {
        let Some(bytes) = value.as_bytes() else {
            return Ok(());
        };
        run_openssl(&["pkey", "-check", "-noout"], bytes, "Invalid private key")
    }
}

type CaLookup = Box<dyn Fn(&Config) -> Option<Vec<u8>> + Send + Sync>;
type HostLookup = Box<dyn Fn(&Config) -> Option<String> + Send + Sync>;

/// Checks that binary values parse as a certificate, optionally issued by a
/// CA and valid for a host name, both looked up from the configuration.
#[derive(Default)]
pub struct CertificateValidator {
    ca: Option<CaLookup>,
    hostname: Option<HostLookup>,
    fields: Vec<String>,
}

/// Stored or default value of `name`, skipping validation so that fields
/// referring to each other can not recurse.
fn unvalidated(config: &Config, name: &str) -> Option<Value> {
    match config.stored(name, None).ok()? {
        Some(value) => Some(value),
        None => match config.field(name).ok()?.default_value() {
            DefaultValue::Value(value) => Some(value.clone()),
            DefaultValue::Unset => None,
        },
    }
}

impl CertificateValidator {
    /// Plain parse check.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the certificate to chain to the CA returned by `lookup`.
    #[must_use]
    pub fn with_ca<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&Config) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.ca = Some(Box::new(lookup));
        self
    }

    /// Require the certificate to be valid for the host returned by `lookup`.
    #[must_use]
    pub fn with_hostname<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&Config) -> Option<String> + Send + Sync + 'static,
    {
        self.hostname = Some(Box::new(lookup));
        self
    }

    /// Require the certificate to chain to the CA stored in field `name`.
    #[must_use]
    pub fn ca_field(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.fields.push(name.clone());
        self.with_ca(move |config| {
            unvalidated(config, &name).and_then(|v| v.as_bytes().map(<[u8]>::to_vec))
        })
    }

    /// Require the certificate to be valid for the host name stored in
    /// field `name`.
    #[must_use]
    pub fn hostname_field(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.fields.push(name.clone());
        self.with_hostname(move |config| {
            unvalidated(config, &name).and_then(|v| v.as_str().map(str::to_owned))
        })
    }

    /// Fields named through [`CertificateValidator::ca_field`] and
    /// [`CertificateValidator::hostname_field`].
    #[must_use]
    pub fn referenced_fields(&self) -> &[String] {
        &self.fields
    }
}

impl Validator for CertificateValidator {
    fn validate(&self, config: &Config, value: &Value) -> Result<(), ValidationError> {
        const FAILURE: &str = "Invalid certificate";
        let Some(bytes) = value.as_bytes() else {
            return Ok(());
        };

        let ca = self.ca.as_ref().and_then(|lookup| lookup(config));
        let hostname = self.hostname.as_ref().and_then(|lookup| lookup(config));

        // The CA file lives only for the duration of the openssl call.
        let ca_file = match ca {
            Some(ca) => {
                let mut file =
                    tempfile::NamedTempFile::new().map_err(|_| ValidationError::new(FAILURE))?;
                file.write_all(&ca).map_err(|_| ValidationError::new(FAILURE))?;
                Some(file)
            }
            None => None,
        };

        let ca_path = ca_file
            .as_ref()
            .map(|f| f.path().to_string_lossy().into_owned());

        let mut args = vec!["verify"];
        if let Some(path) = ca_path.as_deref() {
            args.extend(["-CAfile", path]);
        }
        if let Some(host) = hostname.as_deref() {
            args.extend(["-verify_hostname", host]);
        }

        run_openssl(&args, bytes, FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::environment::MemoryEnv;

    fn config() -> Config {
        let dir = tempfile::tempdir().unwrap();
        Config::builder()
            .environment(MemoryEnv::new())
            .env_file(dir.path().join(".env"))
            .secret_file(dir.path().join(".secret.env"))
            .secret_dir(dir.path().join("secrets"))
            .root_mode(false)
            .build()
            .unwrap()
    }

    #[test]
    fn errors_accumulate_across_validators() {
        let config = config();
        let validators: Vec<Box<dyn Validator>> = vec![
            Box::new(MinLength(12)),
            Box::new(LowercaseOnly),
            Box::new(MaxLength(100)),
        ];
        let err = run_all(&validators, &config, &Value::from("Short")).unwrap_err();
        assert_eq!(err.len(), 2);
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn nested_item_errors_are_flattened_with_index() {
        let mut err = ValidationError::empty();
        err.push("Too few items (1 < 2)");
        err.push_item(3, ValidationError::new("Not a valid host name"));
        assert_eq!(err.len(), 2);
        assert_eq!(
            err.flatten(),
            vec![
                "Too few items (1 < 2)".to_string(),
                "item 3: Not a valid host name".to_string()
            ]
        );
    }

    #[test]
    fn empty_item_errors_are_ignored() {
        let mut err = ValidationError::empty();
        err.push_item(0, ValidationError::empty());
        assert!(err.is_empty());
        assert!(err.into_result().is_ok());
    }

    #[test]
    fn length_validators_ignore_non_text() {
        let config = config();
        assert!(MinLength(5).validate(&config, &Value::Int(1)).is_ok());
        assert!(MaxLength(1).validate(&config, &Value::Bool(true)).is_ok());
        assert!(MinLength(5).validate(&config, &Value::Bytes(vec![1, 2])).is_err());
    }

    #[test]
    fn int_range_reports_each_bound() {
        let config = config();
        let range = IntRange {
            min: Some(1),
            max: Some(10),
        };
        assert!(range.validate(&config, &Value::Int(5)).is_ok());
        assert!(range.validate(&config, &Value::Int(0)).is_err());
        assert!(range.validate(&config, &Value::Int(11)).is_err());
    }

    #[test]
    fn hostname_validator() {
        let config = config();
        assert!(HostName.validate(&config, &Value::from("gstack.localhost")).is_ok());
        assert!(HostName.validate(&config, &Value::from("db-01")).is_ok());
        assert!(HostName.validate(&config, &Value::from("-bad")).is_err());
        assert!(HostName.validate(&config, &Value::from("bad host")).is_err());
    }

    #[test]
    fn email_validator() {
        let config = config();
        assert!(EmailAddress.validate(&config, &Value::email("a@b")).is_ok());
        assert!(EmailAddress.validate(&config, &Value::email("nope")).is_err());
    }

    #[test]
    fn garbage_private_key_is_a_validation_error_not_a_crash() {
        let config = config();
        let result = PrivateKeyValidator.validate(&config, &Value::Bytes(b"not a key".to_vec()));
        assert!(result.is_err());
    }

    #[test]
    fn garbage_certificate_is_a_validation_error_not_a_crash() {
        let config = config();
        let validator = CertificateValidator::new()
            .with_ca(|_| Some(b"not a ca".to_vec()))
            .with_hostname(|_| Some("example.org".to_owned()));
        let err = validator
            .validate(&config, &Value::Bytes(b"not a cert".to_vec()))
            .unwrap_err();
        assert_eq!(err.len(), 1);
    }

    #[test]
    fn field_lookups_record_their_references() {
        let validator = CertificateValidator::new()
            .ca_field("CA_CERT")
            .hostname_field("SERVER_NAME");
        assert_eq!(validator.referenced_fields(), ["CA_CERT", "SERVER_NAME"]);
        assert!(CertificateValidator::new().referenced_fields().is_empty());
    }

    #[test]
    fn closure_validators_see_the_value() {
        let config = config();
        let v = validator_fn(|_, value| match value.as_int() {
            Some(i) if i % 2 == 0 => Ok(()),
            _ => Err(ValidationError::new("Must be even")),
        });
        assert!(v.validate(&config, &Value::Int(4)).is_ok());
        assert!(v.validate(&config, &Value::Int(3)).is_err());
    }
}
