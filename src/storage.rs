//! Storage backends.
//!
//! Four interchangeable places a raw value can live:
//!
//! | Backend              | View  | Format                                   |
//! |----------------------|-------|------------------------------------------|
//! | [`EnvVarStorage`]    | app   | process environment variable             |
//! | [`EnvFileStorage`]   | admin | `NAME=value` line, literal text          |
//! | [`SecretFileStorage`]| admin | `NAME=base64` line                       |
//! | [`SecretDirStorage`] | app   | one file per name, explicit owner/mode   |
//!
//! Line files are rewritten whole through a temp file renamed over the
//! original, so a crash never leaves a half-written file behind.

use crate::environment::Environment;
use crate::errors::{self, Result};
use crate::services::Placement;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use nix::unistd::{chown, Gid, Uid};
use regex::Regex;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tempfile::NamedTempFile;
use tracing::debug;

/// Read/write/delete of raw values by name.
pub trait Storage {
    /// Raw value of `name`, `None` when absent.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Store `raw` under `name`; `None` deletes. `placement` is honoured by
    /// backends that manage file ownership and ignored by the others.
    fn write(&self, name: &str, raw: Option<&[u8]>, placement: Option<&Placement>) -> Result<()>;

    /// Remove `name`. Removing an absent name is not an error.
    fn delete(&self, name: &str) -> Result<()> {
        self.write(name, None, None)
    }
}

// ============================================================================
// LINE FILES
// ============================================================================

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([^#\s=][^=]*)=(.*)$").expect("line pattern is a valid regex"))
}

/// Split a `NAME=value` line. Comments and blank lines yield `None`.
#[must_use]
pub fn parse_line(line: &str) -> Option<(&str, &str)> {
    let caps = line_regex().captures(line)?;
    let name = caps.get(1)?.as_str();
    let value = caps.get(2)?.as_str();
    Some((name, value))
}

/// One `NAME=` line found in a line file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEntry {
    /// Zero-based line index.
    pub line: usize,
    /// Name on that line.
    pub name: String,
}

/// A text file of `NAME=value` lines.
#[derive(Debug, Clone)]
pub struct LineFile {
    path: PathBuf,
    create_mode: u32,
}

impl LineFile {
    /// Line file at `path`; created with `create_mode` on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, create_mode: u32) -> Self {
        Self {
            path: path.into(),
            create_mode,
        }
    }

    /// Location of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.lines().map(str::to_owned).collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(errors::io_error("read_line_file", &self.path, e)),
        }
    }

    /// Value of the first line named `name`.
    pub fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self.read_lines()?.iter().find_map(|line| match parse_line(line) {
            Some((n, v)) if n == name => Some(v.to_owned()),
            _ => None,
        }))
    }

    /// Every `NAME=` line in file order, duplicates included.
    pub fn entries(&self) -> Result<Vec<LineEntry>> {
        Ok(self
            .read_lines()?
            .iter()
            .enumerate()
            .filter_map(|(line, text)| {
                parse_line(text).map(|(name, _)| LineEntry {
                    line,
                    name: name.to_owned(),
                })
            })
            .collect())
    }

    /// Replace the first line named `name` in place, append if none matched,
    /// or drop it when `value` is `None`. Later duplicates are left alone.
    pub fn update(&self, name: &str, value: Option<&str>) -> Result<()> {
        let lines = self.read_lines()?;
        let mut out = Vec::with_capacity(lines.len() + 1);
        let mut done = false;

        for line in lines {
            if !done {
                if let Some((n, _)) = parse_line(&line) {
                    if n == name {
                        done = true;
                        if let Some(v) = value {
                            out.push(format!("{name}={v}"));
                        }
                        continue;
                    }
                }
            }
            out.push(line);
        }

        if !done {
            match value {
                Some(v) => out.push(format!("{name}={v}")),
                None => return Ok(()),
            }
        }

        debug!(path = %self.path.display(), name, delete = value.is_none(), "rewriting line file");
        self.write_lines(&out)
    }

    /// Drop the lines at `indices`, keeping everything else verbatim.
    pub fn remove_lines(&self, indices: &[usize]) -> Result<()> {
        if indices.is_empty() {
            return Ok(());
        }
        let lines = self.read_lines()?;
        let kept: Vec<String> = lines
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !indices.contains(i))
            .map(|(_, line)| line)
            .collect();
        self.write_lines(&kept)
    }

    /// Make sure the file exists and is no more permissive than `max_mode`.
    pub(crate) fn ensure(&self, max_mode: u32) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(meta) => {
                let mode = meta.permissions().mode() & 0o777;
                if mode & !max_mode != 0 {
                    tracing::warn!(path = %self.path.display(), mode = %format!("{mode:o}"), "tightening admin file permissions");
                    fs::set_permissions(&self.path, fs::Permissions::from_mode(mode & max_mode))
                        .map_err(|e| errors::io_error("tighten_line_file", &self.path, e))?;
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "creating admin file");
                self.write_lines(&[])
            }
            Err(e) => Err(errors::io_error("stat_line_file", &self.path, e)),
        }
    }

    fn write_lines(&self, lines: &[String]) -> Result<()> {
        let mut contents = lines.join("\n");
        if !lines.is_empty() {
            contents.push('\n');
        }
        let existing = match fs::metadata(&self.path) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(errors::io_error("stat_line_file", &self.path, e)),
        };
        let mode = existing
            .as_ref()
            .map_or(self.create_mode, |meta| meta.permissions().mode() & 0o7777);
        let owner = existing.as_ref().map(|meta| (meta.uid(), meta.gid()));
        atomic_write(&self.path, contents.as_bytes(), mode, owner, "write_line_file")
    }
}

/// Write `contents` to a temp file next to `path`, apply mode and owner,
/// flush, then rename it over `path` and flush the directory entry.
fn atomic_write(
    path: &Path,
    contents: &[u8],
    mode: u32,
    owner: Option<(u32, u32)>,
    operation: &'static str,
) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| errors::io_error(operation, dir, e))?;
    tmp.write_all(contents)
        .map_err(|e| errors::io_error(operation, tmp.path(), e))?;

    if let Some((uid, gid)) = owner {
        let meta = tmp
            .as_file()
            .metadata()
            .map_err(|e| errors::io_error(operation, tmp.path(), e))?;
        if meta.uid() != uid || meta.gid() != gid {
            chown(tmp.path(), Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
                .map_err(|e| errors::nix_error(operation, path, e))?;
        }
    }
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))
        .map_err(|e| errors::io_error(operation, tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| errors::io_error(operation, tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| errors::io_error(operation, path, e.error))?;
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| errors::io_error(operation, dir, e))?;
    Ok(())
}

// ============================================================================
// ADMIN BACKENDS
// ============================================================================

/// Admin view of non-secret fields: literal `NAME=value` lines.
#[derive(Debug, Clone)]
pub struct EnvFileStorage {
    file: LineFile,
}

impl EnvFileStorage {
    /// Backend over the env file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: LineFile::new(path, crate::defaults::env_file_max_mode()),
        }
    }

    /// Underlying line file.
    #[must_use]
    pub fn file(&self) -> &LineFile {
        &self.file
    }
}

impl Storage for EnvFileStorage {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.file.get(name)?.map(String::into_bytes))
    }

    fn write(&self, name: &str, raw: Option<&[u8]>, _placement: Option<&Placement>) -> Result<()> {
        let Some(raw) = raw else {
            return self.file.update(name, None);
        };
        let text = std::str::from_utf8(raw)
            .map_err(|_| errors::invalid_value("env file values must be valid UTF-8"))?;
        if text.contains(['\n', '\r']) {
            return Err(errors::invalid_value("env file values can not contain line breaks"));
        }
        self.file.update(name, Some(text))
    }
}

/// Admin view of secret fields: `NAME=base64` lines.
#[derive(Debug, Clone)]
pub struct SecretFileStorage {
    file: LineFile,
}

impl SecretFileStorage {
    /// Backend over the secret file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: LineFile::new(path, crate::defaults::secret_file_max_mode()),
        }
    }

    /// Underlying line file.
    #[must_use]
    pub fn file(&self) -> &LineFile {
        &self.file
    }
}

impl Storage for SecretFileStorage {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.file
            .get(name)?
            .map(|encoded| {
                STANDARD
                    .decode(encoded.trim())
                    .map_err(|_| errors::invalid_value("secret file entry is not valid base64"))
            })
            .transpose()
    }

    fn write(&self, name: &str, raw: Option<&[u8]>, _placement: Option<&Placement>) -> Result<()> {
        let encoded = raw.map(|raw| STANDARD.encode(raw));
        self.file.update(name, encoded.as_deref())
    }
}

// ============================================================================
// APP BACKENDS
// ============================================================================

/// App view of non-secret fields: environment variables.
///
/// Writes only live as long as the environment they were made in.
#[derive(Clone)]
pub struct EnvVarStorage {
    env: Arc<dyn Environment>,
}

impl EnvVarStorage {
    /// Backend over `env`.
    #[must_use]
    pub fn new(env: Arc<dyn Environment>) -> Self {
        Self { env }
    }
}

impl Storage for EnvVarStorage {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.env.var(name).map(String::into_bytes))
    }

    fn write(&self, name: &str, raw: Option<&[u8]>, _placement: Option<&Placement>) -> Result<()> {
        match raw {
            Some(raw) => {
                let text = std::str::from_utf8(raw)
                    .map_err(|_| errors::invalid_value("environment values must be valid UTF-8"))?;
                self.env.set_var(name, text);
            }
            None => self.env.remove_var(name),
        }
        Ok(())
    }
}

/// App view of secret fields: one file per name with explicit owner and mode.
#[derive(Debug, Clone)]
pub struct SecretDirStorage {
    dir: PathBuf,
}

impl SecretDirStorage {
    /// Backend over the directory at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the file holding `name`.
    pub fn path_of(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
            return Err(errors::invalid_value("secret name is not a valid file name"));
        }
        Ok(self.dir.join(name))
    }
}

impl Storage for SecretDirStorage {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_of(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            // A service that was never provisioned can not see the file.
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
                Ok(None)
            }
            Err(e) => Err(errors::io_error("read_secret_dir", &path, e)),
        }
    }

    fn write(&self, name: &str, raw: Option<&[u8]>, placement: Option<&Placement>) -> Result<()> {
        let path = self.path_of(name)?;
        let Some(raw) = raw else {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(errors::io_error("delete_secret_dir", &path, e)),
            };
        };
        let placement = placement.copied().unwrap_or_default();
        debug!(path = %path.display(), uid = placement.uid, gid = placement.gid, mode = %format!("{:o}", placement.mode), "writing secret file");
        atomic_write(
            &path,
            raw,
            placement.mode,
            Some((placement.uid, placement.gid)),
            "write_secret_dir",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::MemoryEnv;
    use tempfile::TempDir;

    fn current_owner() -> (u32, u32) {
        (
            nix::unistd::geteuid().as_raw(),
            nix::unistd::getegid().as_raw(),
        )
    }

    #[test]
    fn parse_line_ignores_comments_and_blanks() {
        assert_eq!(parse_line("A=1"), Some(("A", "1")));
        assert_eq!(parse_line("  B=x=y"), Some(("B", "x=y")));
        assert_eq!(parse_line("C="), Some(("C", "")));
        assert_eq!(parse_line("# D=1"), None);
        assert_eq!(parse_line("   # E=1"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("=nothing"), None);
    }

    #[test]
    fn update_replaces_in_place_and_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "# header\nA=1\nB=2\n").unwrap();
        let file = LineFile::new(&path, 0o644);

        file.update("A", Some("10")).unwrap();
        file.update("C", Some("3")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "# header\nA=10\nB=2\nC=3\n");

        file.update("B", None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "# header\nA=10\nC=3\n");
    }

    #[test]
    fn first_duplicate_wins_and_later_ones_stay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "A=1\nA=2\n").unwrap();
        let file = LineFile::new(&path, 0o644);

        assert_eq!(file.get("A").unwrap().as_deref(), Some("1"));
        file.update("A", Some("3")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "A=3\nA=2\n");
        file.update("A", None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "A=2\n");
    }

    #[test]
    fn deleting_absent_name_leaves_missing_file_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        LineFile::new(&path, 0o644).update("A", None).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn rewrite_preserves_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".secret.env");
        fs::write(&path, "").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        LineFile::new(&path, 0o644).update("A", Some("1")).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn atomic_write_replaces_without_leaving_temporaries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        atomic_write(&path, b"A=1\n", 0o640, None, "write_line_file").unwrap();
        atomic_write(&path, b"A=2\n", 0o640, Some(current_owner()), "write_line_file").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "A=2\n");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o640);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn atomic_write_into_missing_directory_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent").join(".env");
        let err = atomic_write(&path, b"A=1\n", 0o644, None, "write_line_file").unwrap_err();
        assert!(matches!(err, crate::ConfError::Io { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn new_files_get_create_mode() {
        let dir = TempDir::new().unwrap();
        let storage = SecretFileStorage::new(dir.path().join(".secret.env"));
        storage.write("X", Some(&b"secret"[..]), None).unwrap();
        let mode = fs::metadata(storage.file().path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn secret_file_stores_base64() {
        let dir = TempDir::new().unwrap();
        let storage = SecretFileStorage::new(dir.path().join(".secret.env"));
        storage.write("X", Some(&b"secret"[..]), None).unwrap();
        assert_eq!(
            fs::read_to_string(storage.file().path()).unwrap(),
            "X=c2VjcmV0\n"
        );
        assert_eq!(storage.read("X").unwrap(), Some(b"secret".to_vec()));
    }

    #[test]
    fn corrupted_secret_line_is_invalid_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".secret.env");
        fs::write(&path, "X=***\n").unwrap();
        let err = SecretFileStorage::new(&path).read("X").unwrap_err();
        assert!(matches!(err, crate::ConfError::InvalidValue { .. }));
    }

    #[test]
    fn env_file_rejects_line_breaks() {
        let dir = TempDir::new().unwrap();
        let storage = EnvFileStorage::new(dir.path().join(".env"));
        assert!(storage.write("A", Some(&b"one\ntwo"[..]), None).is_err());
        assert!(storage.write("A", Some(&b"one\rtwo"[..]), None).is_err());
        assert!(storage.read("A").unwrap().is_none());
    }

    #[test]
    fn missing_env_file_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let storage = EnvFileStorage::new(dir.path().join("nope").join(".env"));
        assert_eq!(storage.read("A").unwrap(), None);
    }

    #[test]
    fn env_var_storage_roundtrip() {
        let storage = EnvVarStorage::new(Arc::new(MemoryEnv::new()));
        storage.write("A", Some(&b"x"[..]), None).unwrap();
        assert_eq!(storage.read("A").unwrap(), Some(b"x".to_vec()));
        storage.delete("A").unwrap();
        assert_eq!(storage.read("A").unwrap(), None);
    }

    #[test]
    fn secret_dir_applies_placement() {
        let dir = TempDir::new().unwrap();
        let storage = SecretDirStorage::new(dir.path());
        let (uid, gid) = current_owner();
        let placement = Placement {
            uid,
            gid,
            mode: 0o440,
        };
        storage.write("S", Some(&b"\x00raw\xff"[..]), Some(&placement)).unwrap();

        let meta = fs::metadata(dir.path().join("S")).unwrap();
        assert_eq!(meta.uid(), uid);
        assert_eq!(meta.gid(), gid);
        assert_eq!(meta.permissions().mode() & 0o777, 0o440);
        assert_eq!(storage.read("S").unwrap(), Some(b"\x00raw\xff".to_vec()));
    }

    #[test]
    fn secret_dir_missing_file_is_absent() {
        let dir = TempDir::new().unwrap();
        let storage = SecretDirStorage::new(dir.path());
        assert_eq!(storage.read("NOPE").unwrap(), None);
        storage.delete("NOPE").unwrap();
    }

    #[test]
    fn secret_dir_rejects_path_names() {
        let dir = TempDir::new().unwrap();
        let storage = SecretDirStorage::new(dir.path());
        assert!(storage.read("../etc/passwd").is_err());
        assert!(storage.write("..", Some(&b"x"[..]), None).is_err());
    }

    #[test]
    fn ensure_creates_and_tightens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".secret.env");
        let file = LineFile::new(&path, 0o600);
        file.ensure(0o600).unwrap();
        assert!(path.exists());

        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();
        file.ensure(0o600).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
