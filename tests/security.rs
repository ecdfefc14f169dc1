//! Security-focused tests for stackconf
//!
//! Tests least-privilege provisioning, secrecy classification of admin
//! entries, redaction and file permissions.

use stackconf::{
    AdminFile, Config, ConfigBuilder, ConfError, Field, MemoryEnv, Section, ServiceSpec,
    StaleReason, Status, Value,
};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use tempfile::TempDir;

fn euid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

fn egid() -> u32 {
    nix::unistd::getegid().as_raw()
}

fn builder(dir: &TempDir) -> ConfigBuilder {
    Config::builder()
        .environment(MemoryEnv::new())
        .env_file(dir.path().join(".env"))
        .secret_file(dir.path().join(".secret.env"))
        .secret_dir(dir.path().join("secrets"))
        .privileged_uid(euid())
}

fn stack(dir: &TempDir) -> Config {
    builder(dir)
        .section(
            Section::new("Stack")
                .field(Field::string("DEBUG_LEVEL").default("info"))
                .field(
                    Field::string("DB_PASSWORD")
                        .secret()
                        .service("db", ServiceSpec::new().uid(euid()).gid(egid()))
                        .service("web", ServiceSpec::new().uid(euid()).gid(egid()).mode(0o440)),
                )
                .field(
                    Field::string("MAIL_PASSWORD")
                        .secret()
                        .service("mail", ServiceSpec::new().uid(euid()).gid(egid())),
                ),
        )
        .build()
        .unwrap()
}

// ============================================================================
// LEAST PRIVILEGE
// ============================================================================

#[test]
fn test_unlisted_service_never_receives_secret() {
    let dir = TempDir::new().unwrap();
    let config = stack(&dir);
    config.set("DB_PASSWORD", "db-secret-value").unwrap();
    config.set("MAIL_PASSWORD", "mail-secret-value").unwrap();

    config.prepare("db").unwrap();
    assert!(config.secret_dir_path().join("DB_PASSWORD").exists());
    assert!(!config.secret_dir_path().join("MAIL_PASSWORD").exists());

    config.prepare("unknown-service").unwrap();
    assert!(!config.secret_dir_path().join("MAIL_PASSWORD").exists());
}

#[test]
fn test_unlisted_service_leaves_existing_file_untouched() {
    let dir = TempDir::new().unwrap();
    let config = stack(&dir);
    config.set("DB_PASSWORD", "db-secret-value").unwrap();
    config.set("MAIL_PASSWORD", "mail-secret-value").unwrap();

    config.prepare("web").unwrap();
    let path = config.secret_dir_path().join("DB_PASSWORD");
    let before = fs::metadata(&path).unwrap();

    config.prepare("mail").unwrap();
    let after = fs::metadata(&path).unwrap();
    assert_eq!(before.mode(), after.mode());
    assert_eq!(before.ino(), after.ino());
}

#[test]
fn test_each_service_gets_its_own_mode() {
    let dir = TempDir::new().unwrap();
    let config = stack(&dir);
    config.set("DB_PASSWORD", "db-secret-value").unwrap();
    let path = config.secret_dir_path().join("DB_PASSWORD");

    config.prepare("web").unwrap();
    assert_eq!(fs::metadata(&path).unwrap().mode() & 0o777, 0o440);

    config.prepare("db").unwrap();
    assert_eq!(fs::metadata(&path).unwrap().mode() & 0o777, 0o400);
}

#[test]
fn test_app_mode_can_not_read_admin_view() {
    let dir = TempDir::new().unwrap();
    let config = builder(&dir)
        .privileged_uid(euid().wrapping_add(1))
        .section(Section::new("s").field(Field::string("A")))
        .build()
        .unwrap();
    assert!(!config.root_mode());
    assert!(matches!(
        config.get("A", Some(true)),
        Err(ConfError::PermissionDenied { .. })
    ));
    assert!(matches!(
        config.inspect(),
        Err(ConfError::PermissionDenied { .. })
    ));
}

#[test]
fn test_secret_dir_names_can_not_escape() {
    let dir = TempDir::new().unwrap();
    let config = builder(&dir)
        .section(Section::new("s").field(Field::string("../escape").secret()))
        .build();
    assert!(matches!(config, Err(ConfError::ImproperlyConfigured { .. })));
}

// ============================================================================
// STALENESS
// ============================================================================

#[test]
fn test_secret_in_plain_file_is_stale() {
    let dir = TempDir::new().unwrap();
    let config = stack(&dir);
    fs::write(config.env_file_path(), "DB_PASSWORD=leaked\n").unwrap();

    let stale = config.stale_entries().unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].file, AdminFile::Env);
    assert_eq!(stale[0].reason, StaleReason::Misclassified);
}

#[test]
fn test_plain_value_in_secret_file_is_stale() {
    let dir = TempDir::new().unwrap();
    let config = stack(&dir);
    fs::write(config.secret_file_path(), "DEBUG_LEVEL=aW5mbw==\n").unwrap();

    let stale = config.stale_entries().unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].file, AdminFile::Secret);
    assert_eq!(stale[0].reason, StaleReason::Misclassified);
}

#[test]
fn test_correctly_placed_values_are_never_stale() {
    let dir = TempDir::new().unwrap();
    let config = stack(&dir);
    config.set("DEBUG_LEVEL", "warn").unwrap();
    config.set("DB_PASSWORD", "db-secret-value").unwrap();
    assert!(config.stale_entries().unwrap().is_empty());
}

#[test]
fn test_duplicate_lines_surface_as_stale() {
    let dir = TempDir::new().unwrap();
    let config = stack(&dir);
    fs::write(config.env_file_path(), "DEBUG_LEVEL=warn\nDEBUG_LEVEL=error\n").unwrap();

    assert_eq!(config.get("DEBUG_LEVEL", None).unwrap(), Value::from("warn"));
    let stale = config.stale_entries().unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].line, 1);
    assert_eq!(stale[0].reason, StaleReason::Duplicate);
}

// ============================================================================
// REDACTION
// ============================================================================

#[test]
fn test_report_masks_secrets() {
    let dir = TempDir::new().unwrap();
    let config = stack(&dir);
    config.set("DB_PASSWORD", "db-secret-value").unwrap();

    let report = config.inspect().unwrap();
    assert_eq!(report.field("DB_PASSWORD").unwrap().status, Status::Ok);
    let rendered = report.to_string();
    assert!(!rendered.contains("db-secret-value"));
    assert!(rendered.contains("*****"));
}

#[test]
fn test_errors_never_contain_values() {
    let dir = TempDir::new().unwrap();
    let config = builder(&dir)
        .section(Section::new("s").field(Field::string("PIN").secret().min_length(40)))
        .build()
        .unwrap();

    let err = config.set("PIN", "hunter2hunter2").unwrap_err();
    assert!(!err.to_string().contains("hunter2"));
    assert!(!format!("{err:?}").contains("hunter2"));
}

#[test]
fn test_value_debug_is_redacted() {
    let value = Value::from("correct horse battery staple");
    assert!(!format!("{value:?}").contains("horse"));
}

#[test]
fn test_secret_file_never_holds_plaintext() {
    let dir = TempDir::new().unwrap();
    let config = stack(&dir);
    config.set("DB_PASSWORD", "db-secret-value").unwrap();
    let contents = fs::read_to_string(config.secret_file_path()).unwrap();
    assert!(!contents.contains("db-secret-value"));
}

// ============================================================================
// FILE PERMISSIONS
// ============================================================================

#[test]
fn test_loose_admin_files_are_tightened() {
    let dir = TempDir::new().unwrap();
    let env_file = dir.path().join(".env");
    let secret_file = dir.path().join(".secret.env");
    fs::write(&env_file, "").unwrap();
    fs::write(&secret_file, "").unwrap();
    fs::set_permissions(&env_file, fs::Permissions::from_mode(0o666)).unwrap();
    fs::set_permissions(&secret_file, fs::Permissions::from_mode(0o644)).unwrap();

    let _config = stack(&dir);
    assert_eq!(fs::metadata(&env_file).unwrap().mode() & 0o777, 0o644);
    assert_eq!(fs::metadata(&secret_file).unwrap().mode() & 0o777, 0o600);
}

#[test]
fn test_rewrites_keep_secret_file_private() {
    let dir = TempDir::new().unwrap();
    let config = stack(&dir);
    for value in ["first-secret", "second-secret", "third-secret"] {
        config.set("DB_PASSWORD", value).unwrap();
        let mode = fs::metadata(config.secret_file_path()).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}

#[test]
fn test_line_injection_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = stack(&dir);
    let err = config.set("DEBUG_LEVEL", "info\nDB_PASSWORD=injected").unwrap_err();
    assert!(matches!(err, ConfError::InvalidValue { .. }));
    assert!(fs::read_to_string(config.env_file_path()).unwrap().is_empty());
}
