//! Default values for paths, modes and key derivation.

/// Environment variable overriding the admin non-secret file path.
pub const ENV_FILE_VAR: &str = "STACKCONF_ENV_FILE";
/// Environment variable overriding the admin secret file path.
pub const SECRET_FILE_VAR: &str = "STACKCONF_SECRET_FILE";
/// Environment variable overriding the per-service secret directory.
pub const SECRET_DIR_VAR: &str = "STACKCONF_SECRET_DIR";
/// Environment variable selecting the report theme.
pub const THEME_VAR: &str = "STACKCONF_THEME";

/// Mask shown in place of secret values.
pub const SECRET_MASK: &str = "*****";

/// PBKDF2 iterations for newly encrypted tokens.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Password prompts before decryption gives up.
pub const MAX_PASSWORD_ATTEMPTS: u32 = 3;

#[inline]
#[must_use]
pub(crate) fn default_env_file() -> &'static str {
    "/host/.env"
}

#[inline]
#[must_use]
pub(crate) fn default_secret_file() -> &'static str {
    "/host/.secret.env"
}

#[inline]
#[must_use]
pub(crate) fn default_secret_dir() -> &'static str {
    "/run/secrets"
}

/// uid of the privileged owner.
#[inline]
#[must_use]
pub(crate) fn default_privileged_uid() -> u32 {
    0
}

/// Mode of a provisioned secret when the service entry names none.
#[inline]
#[must_use]
pub(crate) fn default_secret_mode() -> u32 {
    0o400
}

/// Most permissive mode tolerated on the admin non-secret file.
#[inline]
#[must_use]
pub(crate) fn env_file_max_mode() -> u32 {
    0o644
}

/// Most permissive mode tolerated on the admin secret file.
#[inline]
#[must_use]
pub(crate) fn secret_file_max_mode() -> u32 {
    0o600
}

/// Most permissive mode tolerated on the secret directory.
#[inline]
#[must_use]
pub(crate) fn secret_dir_max_mode() -> u32 {
    0o755
}

/// Default list separator.
#[inline]
#[must_use]
pub(crate) fn default_separator() -> String {
    ",".to_owned()
}
