//! Operator report: per-field status, stale admin entries and the
//! cross-field check.

use crate::config::Config;
use crate::errors::{self, Result};
use crate::storage::LineFile;
use owo_colors::OwoColorize;
use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Write as _};
use std::str::FromStr;
use tracing::{info, warn};

/// Logical state of a field, derived from what is currently stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Stored admin value passes validation.
    Ok,
    /// Nothing stored, default in effect.
    Default,
    /// Nothing stored, no default.
    Missing,
    /// Stored admin value fails validation or can not be decoded.
    Invalid,
}

/// Report rendering style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Theme {
    /// Plain ASCII flags.
    #[default]
    Simple,
    /// Unicode bullets with ANSI colors.
    Colors,
}

impl FromStr for Theme {
    type Err = crate::ConfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "simple" => Ok(Self::Simple),
            "colors" | "colours" => Ok(Self::Colors),
            other => Err(errors::improperly_configured(
                "parse_theme",
                format!("unknown theme {other:?}"),
            )),
        }
    }
}

impl Theme {
    fn flag(self, status: Status) -> String {
        match (self, status) {
            (Self::Simple, Status::Ok) => " ".to_owned(),
            (Self::Simple, Status::Default) => ".".to_owned(),
            (Self::Simple, Status::Missing) => "?".to_owned(),
            (Self::Simple, Status::Invalid) => "!".to_owned(),
            (Self::Colors, Status::Ok) => "●".green().to_string(),
            (Self::Colors, Status::Default) => "○".blue().to_string(),
            (Self::Colors, Status::Missing) => "━".yellow().to_string(),
            (Self::Colors, Status::Invalid) => "✖".red().to_string(),
        }
    }

    fn heading(self, text: &str) -> String {
        match self {
            Self::Simple => format!("[{text}]"),
            Self::Colors => text.bold().to_string(),
        }
    }

    fn error(self, text: &str) -> String {
        match self {
            Self::Simple => text.to_owned(),
            Self::Colors => text.red().to_string(),
        }
    }
}

/// One field's line in the report.
#[derive(Debug, Clone)]
pub struct FieldReport {
    /// Field name.
    pub name: String,
    /// Derived status.
    pub status: Status,
    /// Display value for `Ok`/`Default`; masked for secrets.
    pub value: Option<String>,
    /// Validation or decoding messages for `Invalid`.
    pub errors: Vec<String>,
    /// Whether the field is secret.
    pub secret: bool,
    /// Declared help text.
    pub help: Option<String>,
}

/// Report of one section.
#[derive(Debug, Clone)]
pub struct SectionReport {
    /// Section name.
    pub name: String,
    /// Section description.
    pub doc: Option<String>,
    /// Fields in declaration order.
    pub fields: Vec<FieldReport>,
}

/// Admin file an entry was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AdminFile {
    /// Non-secret file.
    Env,
    /// Secret file.
    Secret,
}

impl fmt::Display for AdminFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Env => "env file",
            Self::Secret => "secret file",
        })
    }
}

/// Why an admin entry is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// No field with this name is declared.
    Undeclared,
    /// Declared, but with the other secrecy classification.
    Misclassified,
    /// A later line repeating a name already seen in the same file.
    Duplicate,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Undeclared => "not declared",
            Self::Misclassified => "wrong file for its secrecy",
            Self::Duplicate => "duplicate line",
        })
    }
}

/// Admin file line that does not belong where it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleEntry {
    /// File holding the line.
    pub file: AdminFile,
    /// Zero-based line index.
    pub line: usize,
    /// Name on the line.
    pub name: String,
    /// Reason it is stale.
    pub reason: StaleReason,
}

/// Outcome of the cross-field check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrossCheck {
    /// No cross-field check is declared.
    NotDeclared,
    /// Not run because at least one field is invalid.
    Skipped,
    /// Ran and returned these violations (possibly none).
    Ran(Vec<String>),
}

/// Full operator report.
#[derive(Debug, Clone)]
pub struct Report {
    /// Sections in declaration order.
    pub sections: Vec<SectionReport>,
    /// Stale entries of both admin files.
    pub stale: Vec<StaleEntry>,
    /// Cross-field check outcome.
    pub cross: CrossCheck,
    /// Theme used by `Display`.
    pub theme: Theme,
}

impl Report {
    /// Every field report regardless of section.
    pub fn fields(&self) -> impl Iterator<Item = &FieldReport> {
        self.sections.iter().flat_map(|s| s.fields.iter())
    }

    /// Report line of `name`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldReport> {
        self.fields().find(|f| f.name == name)
    }

    /// No invalid or missing field, no stale entry, no cross-field violation.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.fields()
            .all(|f| matches!(f.status, Status::Ok | Status::Default))
            && self.stale.is_empty()
            && match &self.cross {
                CrossCheck::Ran(violations) => violations.is_empty(),
                CrossCheck::NotDeclared => true,
                CrossCheck::Skipped => false,
            }
    }

    /// Render with an explicit theme.
    #[must_use]
    pub fn render(&self, theme: Theme) -> String {
        let mut out = String::new();
        for section in &self.sections {
            let _ = writeln!(out, "{}", theme.heading(&section.name));
            if let Some(doc) = &section.doc {
                let _ = writeln!(out, "  {doc}");
            }
            for field in &section.fields {
                let flag = theme.flag(field.status);
                match &field.value {
                    Some(value) => {
                        let _ = writeln!(out, " {flag} {} = {value}", field.name);
                    }
                    None => {
                        let _ = writeln!(out, " {flag} {}", field.name);
                    }
                }
                for error in &field.errors {
                    let _ = writeln!(out, "     {}", theme.error(error));
                }
            }
            out.push('\n');
        }

        if !self.stale.is_empty() {
            let _ = writeln!(out, "{}", theme.heading("Stale entries"));
            for entry in &self.stale {
                let _ = writeln!(
                    out,
                    "   {} ({} line {}): {}",
                    entry.name,
                    entry.file,
                    entry.line + 1,
                    entry.reason
                );
            }
            out.push('\n');
        }

        match &self.cross {
            CrossCheck::NotDeclared => {}
            CrossCheck::Skipped => {
                let _ = writeln!(out, "{}", theme.heading("Cross-field validation"));
                let _ = writeln!(out, "   skipped due to value errors");
            }
            CrossCheck::Ran(violations) => {
                let _ = writeln!(out, "{}", theme.heading("Cross-field validation"));
                if violations.is_empty() {
                    let _ = writeln!(out, "   ok");
                }
                for violation in violations {
                    let _ = writeln!(out, "   {}", theme.error(violation));
                }
            }
        }
        out
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(self.theme))
    }
}

// ============================================================================
// INSPECTION
// ============================================================================

impl Config {
    /// Build the operator report. Root mode only.
    pub fn inspect(&self) -> Result<Report> {
        if !self.root_mode() {
            return Err(errors::permission_denied("inspect"));
        }

        let mut any_invalid = false;
        let mut sections = Vec::with_capacity(self.sections().len());
        for section in self.sections() {
            let mut fields = Vec::with_capacity(section.fields().len());
            for field in section.fields() {
                let mut report = FieldReport {
                    name: field.name().to_owned(),
                    status: Status::Missing,
                    value: None,
                    errors: Vec::new(),
                    secret: field.is_secret(),
                    help: field.help_text().map(str::to_owned),
                };
                match self.stored(field.name(), Some(true)) {
                    Ok(Some(value)) => match field.validate(self, &value) {
                        Ok(()) => {
                            report.status = Status::Ok;
                            report.value = Some(field.reportable(&value));
                        }
                        Err(e) => {
                            report.status = Status::Invalid;
                            report.errors = e.flatten();
                        }
                    },
                    Ok(None) => {
                        if let Some(default) = field.default_value().value() {
                            report.status = Status::Default;
                            report.value = Some(field.reportable(default));
                        }
                    }
                    Err(e @ crate::ConfError::InvalidValue { .. }) => {
                        report.status = Status::Invalid;
                        report.errors = vec![e.to_string()];
                    }
                    Err(e) => return Err(e),
                }
                any_invalid |= report.status == Status::Invalid;
                fields.push(report);
            }
            sections.push(SectionReport {
                name: section.name().to_owned(),
                doc: section.doc_text().map(str::to_owned),
                fields,
            });
        }

        let cross = match self.cross_validator() {
            None => CrossCheck::NotDeclared,
            Some(_) if any_invalid => CrossCheck::Skipped,
            Some(check) => CrossCheck::Ran(check(self)),
        };

        Ok(Report {
            sections,
            stale: self.stale_entries()?,
            cross,
            theme: self.theme(),
        })
    }

    /// Admin file lines that are undeclared, in the wrong file for their
    /// secrecy, or repeat an earlier line. Root mode only.
    pub fn stale_entries(&self) -> Result<Vec<StaleEntry>> {
        if !self.root_mode() {
            return Err(errors::permission_denied("stale_entries"));
        }
        let mut stale = self.stale_in(self.env_file().file(), AdminFile::Env, false)?;
        stale.extend(self.stale_in(self.secret_file().file(), AdminFile::Secret, true)?);
        Ok(stale)
    }

    fn stale_in(&self, file: &LineFile, kind: AdminFile, secret: bool) -> Result<Vec<StaleEntry>> {
        let mut seen = HashSet::new();
        let mut stale = Vec::new();
        for entry in file.entries()? {
            let reason = match self.field(&entry.name) {
                Err(_) => Some(StaleReason::Undeclared),
                Ok(field) if field.is_secret() != secret => Some(StaleReason::Misclassified),
                Ok(_) if seen.contains(&entry.name) => Some(StaleReason::Duplicate),
                Ok(_) => None,
            };
            seen.insert(entry.name.clone());
            if let Some(reason) = reason {
                stale.push(StaleEntry {
                    file: kind,
                    line: entry.line,
                    name: entry.name,
                    reason,
                });
            }
        }
        Ok(stale)
    }

    /// Delete every stale line and return what was removed. Root mode only.
    pub fn remove_stale(&self) -> Result<Vec<StaleEntry>> {
        let stale = self.stale_entries()?;
        let mut by_file: BTreeMap<AdminFile, Vec<usize>> = BTreeMap::new();
        for entry in &stale {
            by_file.entry(entry.file).or_default().push(entry.line);
            warn!(name = %entry.name, file = %entry.file, reason = %entry.reason, "removing stale entry");
        }
        for (kind, lines) in by_file {
            let file = match kind {
                AdminFile::Env => self.env_file().file(),
                AdminFile::Secret => self.secret_file().file(),
            };
            file.remove_lines(&lines)?;
        }
        if !stale.is_empty() {
            info!(removed = stale.len(), "stale entries removed");
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Section;
    use crate::environment::MemoryEnv;
    use crate::fields::Field;
    use std::fs;
    use tempfile::TempDir;

    fn build(dir: &TempDir) -> Config {
        Config::builder()
            .environment(MemoryEnv::new())
            .env_file(dir.path().join(".env"))
            .secret_file(dir.path().join(".secret.env"))
            .secret_dir(dir.path().join("secrets"))
            .privileged_uid(nix::unistd::geteuid().as_raw())
            .section(
                Section::new("Animals")
                    .doc("Farm settings")
                    .field(Field::string("ANIMAL").default("duck"))
                    .field(Field::string("LIKES").min_length(5))
                    .field(Field::string("SAIS").secret().min_length(2)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn statuses_follow_storage() {
        let dir = TempDir::new().unwrap();
        let config = build(&dir);
        config.set_with("LIKES", Some("no".into()), false).unwrap();
        config.set("SAIS", "quack").unwrap();

        let report = config.inspect().unwrap();
        assert_eq!(report.field("ANIMAL").unwrap().status, Status::Default);
        assert_eq!(report.field("ANIMAL").unwrap().value.as_deref(), Some("duck"));
        assert_eq!(report.field("LIKES").unwrap().status, Status::Invalid);
        assert_eq!(report.field("SAIS").unwrap().status, Status::Ok);
        assert_eq!(report.field("SAIS").unwrap().value.as_deref(), Some("*****"));
        assert!(!report.is_clean());
    }

    #[test]
    fn simple_render_uses_flags() {
        let dir = TempDir::new().unwrap();
        let config = build(&dir);
        let text = config.inspect().unwrap().render(Theme::Simple);
        assert!(text.contains("[Animals]"));
        assert!(text.contains(" . ANIMAL = duck"));
        assert!(text.contains(" ? LIKES"));
    }

    #[test]
    fn undecodable_secret_line_is_invalid() {
        let dir = TempDir::new().unwrap();
        let config = build(&dir);
        fs::write(config.secret_file_path(), "SAIS=@@@\n").unwrap();
        let report = config.inspect().unwrap();
        assert_eq!(report.field("SAIS").unwrap().status, Status::Invalid);
    }

    #[test]
    fn stale_reasons() {
        let dir = TempDir::new().unwrap();
        let config = build(&dir);
        fs::write(config.env_file_path(), "ANIMAL=cow\nSAIS=oops\nGONE=1\nANIMAL=pig\n").unwrap();
        fs::write(config.secret_file_path(), "LIKES=YWJj\nSAIS=cXVhY2s=\n").unwrap();

        let stale = config.stale_entries().unwrap();
        let summary: Vec<(AdminFile, &str, StaleReason)> = stale
            .iter()
            .map(|e| (e.file, e.name.as_str(), e.reason))
            .collect();
        assert_eq!(
            summary,
            vec![
                (AdminFile::Env, "SAIS", StaleReason::Misclassified),
                (AdminFile::Env, "GONE", StaleReason::Undeclared),
                (AdminFile::Env, "ANIMAL", StaleReason::Duplicate),
                (AdminFile::Secret, "LIKES", StaleReason::Misclassified),
            ]
        );
    }

    #[test]
    fn remove_stale_keeps_valid_lines() {
        let dir = TempDir::new().unwrap();
        let config = build(&dir);
        fs::write(config.env_file_path(), "# keep\nANIMAL=cow\nGONE=1\nANIMAL=pig\n").unwrap();

        let removed = config.remove_stale().unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(
            fs::read_to_string(config.env_file_path()).unwrap(),
            "# keep\nANIMAL=cow\n"
        );
        assert!(config.stale_entries().unwrap().is_empty());
    }

    #[test]
    fn cross_check_skipped_on_invalid_fields() {
        let dir = TempDir::new().unwrap();
        let config = Config::builder()
            .environment(MemoryEnv::new())
            .env_file(dir.path().join(".env"))
            .secret_file(dir.path().join(".secret.env"))
            .secret_dir(dir.path().join("secrets"))
            .privileged_uid(nix::unistd::geteuid().as_raw())
            .section(Section::new("s").field(Field::integer("N")))
            .cross_validate(|_| vec!["always wrong".to_owned()])
            .build()
            .unwrap();

        fs::write(config.env_file_path(), "N=abc\n").unwrap();
        let report = config.inspect().unwrap();
        assert_eq!(report.cross, CrossCheck::Skipped);
        assert!(report.to_string().contains("skipped due to value errors"));

        config.set("N", 3i64).unwrap();
        let report = config.inspect().unwrap();
        assert_eq!(report.cross, CrossCheck::Ran(vec!["always wrong".to_owned()]));
    }

    #[test]
    fn inspect_requires_root_mode() {
        let dir = TempDir::new().unwrap();
        let config = Config::builder()
            .environment(MemoryEnv::new())
            .env_file(dir.path().join(".env"))
            .secret_file(dir.path().join(".secret.env"))
            .secret_dir(dir.path().join("secrets"))
            .root_mode(false)
            .build()
            .unwrap();
        assert!(config.inspect().is_err());
        assert!(config.remove_stale().is_err());
    }

    #[test]
    fn theme_parsing() {
        assert_eq!("colors".parse::<Theme>().unwrap(), Theme::Colors);
        assert_eq!("Simple".parse::<Theme>().unwrap(), Theme::Simple);
        assert!("neon".parse::<Theme>().is_err());
    }
}
