//! The configuration registry.
//!
//! A [`Config`] is assembled once per process from declared [`Section`]s.
//! It owns the resolved admin file paths, the secret directory and the
//! access mode, and routes every read and write of a field to the right
//! backend:
//!
//! | Field      | root (admin) view       | app (service) view        |
//! |------------|-------------------------|---------------------------|
//! | non-secret | env file                | environment variable      |
//! | secret     | secret file (base64)    | secret directory file     |

use crate::defaults::{
    default_env_file, default_privileged_uid, default_secret_dir, default_secret_file,
    env_file_max_mode, secret_dir_max_mode, secret_file_max_mode, ENV_FILE_VAR, SECRET_DIR_VAR,
    SECRET_FILE_VAR, THEME_VAR,
};
use crate::encryption::{self, Password};
use crate::environment::{Environment, ProcessEnv};
use crate::errors::{self, Result};
use crate::fields::Field;
use crate::inspect::Theme;
use crate::storage::{EnvFileStorage, EnvVarStorage, SecretDirStorage, SecretFileStorage, Storage};
use crate::value::{DefaultValue, Value};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Cross-field check run by the inspection report once every field is valid.
///
/// Returns human readable violations; an empty list means all is well.
pub type CrossValidator = Box<dyn Fn(&Config) -> Vec<String> + Send + Sync>;

/// Named, documented group of fields.
#[derive(Debug)]
pub struct Section {
    name: String,
    doc: Option<String>,
    fields: Vec<Field>,
}

impl Section {
    /// Empty section.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc: None,
            fields: Vec::new(),
        }
    }

    /// Description shown in reports.
    #[must_use]
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Append a field.
    #[must_use]
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Section name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Section description.
    #[must_use]
    pub fn doc_text(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    /// Fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`Config`].
#[derive(Default)]
pub struct ConfigBuilder {
    sections: Vec<Section>,
    environment: Option<Arc<dyn Environment>>,
    env_file: Option<PathBuf>,
    secret_file: Option<PathBuf>,
    secret_dir: Option<PathBuf>,
    root_mode: Option<bool>,
    privileged_uid: Option<u32>,
    theme: Option<Theme>,
    cross_validate: Option<CrossValidator>,
}

impl ConfigBuilder {
    /// Add one section.
    #[must_use]
    pub fn section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    /// Add several sections.
    #[must_use]
    pub fn sections(mut self, sections: impl IntoIterator<Item = Section>) -> Self {
        self.sections.extend(sections);
        self
    }

    /// Environment used for path overrides and the app view of plain fields.
    /// Defaults to the process environment.
    #[must_use]
    pub fn environment(mut self, env: impl Environment + 'static) -> Self {
        self.environment = Some(Arc::new(env));
        self
    }

    /// Share an environment with other components.
    #[must_use]
    pub fn shared_environment(mut self, env: Arc<dyn Environment>) -> Self {
        self.environment = Some(env);
        self
    }

    /// Admin file for non-secret values.
    #[must_use]
    pub fn env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Admin file for secret values.
    #[must_use]
    pub fn secret_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.secret_file = Some(path.into());
        self
    }

    /// Directory receiving provisioned secrets.
    #[must_use]
    pub fn secret_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.secret_dir = Some(path.into());
        self
    }

    /// Force root mode on or off. Forcing it on requires the privileged uid.
    #[must_use]
    pub fn root_mode(mut self, root_mode: bool) -> Self {
        self.root_mode = Some(root_mode);
        self
    }

    /// uid treated as the privileged owner (0 unless overridden).
    #[must_use]
    pub fn privileged_uid(mut self, uid: u32) -> Self {
        self.privileged_uid = Some(uid);
        self
    }

    /// Report theme. Defaults to `STACKCONF_THEME`, then simple.
    #[must_use]
    pub fn theme(mut self, theme: Theme) -> Self {
        self.theme = Some(theme);
        self
    }

    /// Cross-field check shown in the inspection report.
    #[must_use]
    pub fn cross_validate<F>(mut self, check: F) -> Self
    where
        F: Fn(&Config) -> Vec<String> + Send + Sync + 'static,
    {
        self.cross_validate = Some(Box::new(check));
        self
    }

    /// Resolve paths and access mode, register every field and, in root
    /// mode, prepare the admin files.
    pub fn build(self) -> Result<Config> {
        let env: Arc<dyn Environment> = self.environment.unwrap_or_else(|| Arc::new(ProcessEnv));

        let resolve = |explicit: Option<PathBuf>, var: &str, fallback: &str| {
            explicit
                .or_else(|| env.var(var).filter(|v| !v.is_empty()).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(fallback))
        };
        let env_file = resolve(self.env_file, ENV_FILE_VAR, default_env_file());
        let secret_file = resolve(self.secret_file, SECRET_FILE_VAR, default_secret_file());
        let secret_dir = resolve(self.secret_dir, SECRET_DIR_VAR, default_secret_dir());

        let theme = match self.theme {
            Some(theme) => theme,
            None => match env.var(THEME_VAR) {
                Some(name) => name.parse()?,
                None => Theme::default(),
            },
        };

        let privileged_uid = self.privileged_uid.unwrap_or_else(default_privileged_uid);
        let privileged = nix::unistd::geteuid().as_raw() == privileged_uid;
        let root_mode = match self.root_mode {
            Some(true) if !privileged => return Err(errors::permission_denied("force_root_mode")),
            Some(forced) => forced,
            None => privileged,
        };

        let mut index = HashMap::new();
        for (s, section) in self.sections.iter().enumerate() {
            for (f, field) in section.fields.iter().enumerate() {
                field.check()?;
                if index.insert(field.name().to_owned(), (s, f)).is_some() {
                    return Err(errors::improperly_configured(
                        "build_config",
                        format!("field {} is declared more than once", field.name()),
                    ));
                }
            }
        }
        for field in self.sections.iter().flat_map(|s| s.fields.iter()) {
            for reference in field.kind().references() {
                if reference == field.name() {
                    return Err(errors::improperly_configured(
                        "build_config",
                        format!("field {} refers to itself", field.name()),
                    ));
                }
                if !index.contains_key(&reference) {
                    return Err(errors::improperly_configured(
                        "build_config",
                        format!("field {} refers to undeclared field {reference}", field.name()),
                    ));
                }
            }
        }

        let config = Config {
            sections: self.sections,
            index,
            env_file: EnvFileStorage::new(env_file),
            secret_file: SecretFileStorage::new(secret_file),
            secret_dir: SecretDirStorage::new(&secret_dir),
            env_var: EnvVarStorage::new(Arc::clone(&env)),
            secret_dir_path: secret_dir,
            root_mode,
            privileged,
            theme,
            cross_validate: self.cross_validate,
        };

        if root_mode {
            config.prepare_admin_files()?;
        }

        debug!(
            root_mode,
            fields = config.index.len(),
            env_file = %config.env_file.file().path().display(),
            secret_file = %config.secret_file.file().path().display(),
            "configuration registry built"
        );
        Ok(config)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Registry of declared fields bound to their storage.
pub struct Config {
    sections: Vec<Section>,
    index: HashMap<String, (usize, usize)>,
    env_file: EnvFileStorage,
    secret_file: SecretFileStorage,
    secret_dir: SecretDirStorage,
    env_var: EnvVarStorage,
    secret_dir_path: PathBuf,
    root_mode: bool,
    privileged: bool,
    theme: Theme,
    cross_validate: Option<CrossValidator>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("sections", &self.sections.len())
            .field("fields", &self.index.len())
            .field("env_file", &self.env_file.file().path())
            .field("secret_file", &self.secret_file.file().path())
            .field("secret_dir", &self.secret_dir_path)
            .field("root_mode", &self.root_mode)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Start declaring a registry.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Whether admin operations are allowed.
    #[must_use]
    pub fn root_mode(&self) -> bool {
        self.root_mode
    }

    /// Admin file for non-secret values.
    #[must_use]
    pub fn env_file_path(&self) -> &Path {
        self.env_file.file().path()
    }

    /// Admin file for secret values.
    #[must_use]
    pub fn secret_file_path(&self) -> &Path {
        self.secret_file.file().path()
    }

    /// Directory receiving provisioned secrets.
    #[must_use]
    pub fn secret_dir_path(&self) -> &Path {
        &self.secret_dir_path
    }

    /// Report theme.
    #[must_use]
    pub fn theme(&self) -> Theme {
        self.theme
    }

    /// Declared sections in order.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Every field in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.sections.iter().flat_map(|s| s.fields.iter())
    }

    /// Declared field by name.
    pub fn field(&self, name: &str) -> Result<&Field> {
        self.index
            .get(name)
            .map(|&(s, f)| &self.sections[s].fields[f])
            .ok_or_else(|| errors::no_such_config(name))
    }

    /// Whether `name` is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub(crate) fn cross_validator(&self) -> Option<&CrossValidator> {
        self.cross_validate.as_ref()
    }

    pub(crate) fn env_file(&self) -> &EnvFileStorage {
        &self.env_file
    }

    pub(crate) fn secret_file(&self) -> &SecretFileStorage {
        &self.secret_file
    }

    fn require_root(&self, operation: &'static str) -> Result<()> {
        if self.root_mode {
            Ok(())
        } else {
            Err(errors::permission_denied(operation))
        }
    }

    fn storage(&self, field: &Field, root: bool) -> &dyn Storage {
        match (root, field.is_secret()) {
            (true, false) => &self.env_file,
            (true, true) => &self.secret_file,
            (false, false) => &self.env_var,
            (false, true) => &self.secret_dir,
        }
    }

    fn resolve_root(&self, root: Option<bool>) -> Result<bool> {
        match root {
            None => Ok(self.root_mode),
            Some(true) if !self.privileged => Err(errors::permission_denied("read_root_value")),
            Some(root) => Ok(root),
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Stored value of `name` in the requested view, decoded but neither
    /// defaulted nor validated.
    pub fn stored(&self, name: &str, root: Option<bool>) -> Result<Option<Value>> {
        let field = self.field(name)?;
        let root = self.resolve_root(root)?;
        self.storage(field, root)
            .read(name)?
            .map(|raw| field.decode(&raw))
            .transpose()
    }

    /// Validated value of `name`, or its default while nothing is stored.
    ///
    /// `root` selects the admin view (`Some(true)`) or the app view
    /// (`Some(false)`); `None` follows the registry's mode.
    pub fn get(&self, name: &str, root: Option<bool>) -> Result<Value> {
        let field = self.field(name)?;
        match self.stored(name, root)? {
            Some(value) => {
                field.validate(self, &value)?;
                Ok(value)
            }
            None => match field.default_value() {
                DefaultValue::Value(value) => Ok(value.clone()),
                DefaultValue::Unset => Err(errors::config_missing(name)),
            },
        }
    }

    /// [`Config::get`] rendered to the raw stream form.
    pub fn get_stream(&self, name: &str, root: Option<bool>) -> Result<Vec<u8>> {
        let value = self.get(name, root)?;
        self.field(name)?.kind().to_stream(&value)
    }

    // ------------------------------------------------------------------------
    // Admin writes
    // ------------------------------------------------------------------------

    /// Validate and store `value` in the admin view.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.set_with(name, Some(value.into()), true)
    }

    /// Store or, with `None`, delete the admin value of `name`.
    ///
    /// `validate = false` skips validators, for repairing a value that
    /// itself no longer validates. The value must still fit its kind.
    pub fn set_with(&self, name: &str, value: Option<Value>, validate: bool) -> Result<()> {
        self.require_root("set")?;
        let field = self.field(name)?;
        let storage = self.storage(field, true);

        let Some(value) = value else {
            storage.delete(name)?;
            info!(field = name, "deleted admin value");
            return Ok(());
        };

        if validate {
            field.validate(self, &value)?;
        }
        let raw = field.encode(&value)?;
        storage.write(name, Some(raw.as_slice()), None)?;
        info!(field = name, secret = field.is_secret(), validated = validate, "stored admin value");
        Ok(())
    }

    /// Delete the admin value of `name`.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.set_with(name, None, true)
    }

    /// Parse raw input (e.g. stdin) and store it in the admin view.
    pub fn set_stream(&self, name: &str, raw: &[u8], validate: bool) -> Result<()> {
        self.require_root("set")?;
        let value = self.field(name)?.kind().from_stream(raw)?;
        self.set_with(name, Some(value), validate)
    }

    // ------------------------------------------------------------------------
    // App writes and provisioning
    // ------------------------------------------------------------------------

    /// Validate and write `value` to the app view.
    ///
    /// Plain fields go to the environment; `service` is ignored. Secret
    /// fields go to the secret directory with the placement declared for
    /// `service`, which must be listed on the field.
    pub fn set_app(&self, name: &str, value: impl Into<Value>, service: &str) -> Result<()> {
        let field = self.field(name)?;
        let value = value.into();
        field.validate(self, &value)?;
        let raw = field.encode(&value)?;

        if !field.is_secret() {
            return self.env_var.write(name, Some(raw.as_slice()), None);
        }
        let spec = field
            .service_specs()
            .get(service)
            .ok_or_else(|| errors::service_not_found(name, service))?;
        let placement = spec.placement()?;
        self.secret_dir.write(name, Some(raw.as_slice()), Some(&placement))
    }

    /// Copy every secret listed for `service` from the admin view into the
    /// secret directory with that service's owner, group and mode.
    ///
    /// Fields not listing `service` and non-secret fields are skipped. The
    /// first failure is returned with the field name attached; files already
    /// written stay in place and a re-run overwrites them.
    pub fn prepare(&self, service: &str) -> Result<()> {
        self.require_root("prepare")?;
        for field in self.fields() {
            if !field.is_secret() {
                continue;
            }
            let Some(spec) = field.service_specs().get(service) else {
                continue;
            };
            let name = field.name();
            self.provision(field, spec)
                .map_err(|e| errors::provision_failed(name, e))?;
            info!(field = name, service, "provisioned secret");
        }
        Ok(())
    }

    fn provision(&self, field: &Field, spec: &crate::services::ServiceSpec) -> Result<()> {
        let value = self.get(field.name(), Some(true))?;
        let placement = spec.placement()?;
        let raw = Zeroizing::new(field.encode(&value)?);
        self.secret_dir.write(field.name(), Some(raw.as_slice()), Some(&placement))
    }

    /// Decrypt the encryption token stored in string field `name`.
    ///
    /// `prompt` is asked for a password up to three times and receives the
    /// attempt number, starting at 1. Returning `None` aborts.
    pub fn reveal<F>(&self, name: &str, prompt: F) -> Result<Zeroizing<String>>
    where
        F: FnMut(u32) -> Option<Password>,
    {
        let value = self.get(name, None)?;
        let token = value
            .as_str()
            .ok_or_else(|| errors::invalid_value("only text fields can hold encrypted tokens"))?;
        let plain = encryption::decrypt_with_retries(token, prompt)?;
        String::from_utf8(plain.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| errors::invalid_value("decrypted value is not valid UTF-8"))
    }

    // ------------------------------------------------------------------------
    // Admin file preparation
    // ------------------------------------------------------------------------

    fn prepare_admin_files(&self) -> Result<()> {
        for path in [self.env_file.file().path(), self.secret_file.file().path()] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                create_dir(parent, secret_dir_max_mode())?;
            }
        }
        self.env_file.file().ensure(env_file_max_mode())?;
        self.secret_file.file().ensure(secret_file_max_mode())?;
        create_dir(&self.secret_dir_path, secret_dir_max_mode())?;
        tighten_dir(&self.secret_dir_path, secret_dir_max_mode())
    }
}

fn create_dir(path: &Path, mode: u32) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    info!(path = %path.display(), mode = %format!("{mode:o}"), "creating directory");
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|e| errors::io_error("create_directory", path, e))
}

fn tighten_dir(path: &Path, max_mode: u32) -> Result<()> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(errors::io_error("stat_directory", path, e)),
    };
    let mode = meta.permissions().mode() & 0o777;
    if mode & !max_mode != 0 {
        warn!(path = %path.display(), mode = %format!("{mode:o}"), "tightening directory permissions");
        fs::set_permissions(path, fs::Permissions::from_mode(mode & max_mode))
            .map_err(|e| errors::io_error("tighten_directory", path, e))?;
    }
    Ok(())
}
