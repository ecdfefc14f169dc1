//! Declarative section manifests.
//!
//! ```toml
//! [[section]]
//! name = "Database"
//! doc = "PostgreSQL settings"
//!
//! [[section.field]]
//! name = "DB_PASSWORD"
//! kind = "string"
//! secret = true
//! min_length = 12
//! services = { postgres = [999], django = [1000] }
//!
//! [[section.field]]
//! name = "ALLOWED_HOSTS"
//! kind = "list"
//! item_kind = "string"
//! hostname = true
//! min_items = 1
//! default = ["localhost"]
//! ```

use crate::config::Section;
use crate::defaults::default_separator;
use crate::errors::{self, Result};
use crate::fields::{
    BooleanKind, CertificateKind, EmailKind, Field, FieldKind, FileKind, IntegerKind, ListKind,
    PrivateKeyKind, StringKind,
};
use crate::services::{Services, ServicesRepr};
use crate::validation::{CertificateValidator, HostName, IntRange, LowercaseOnly, Validator};
use crate::value::Value;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    #[serde(default, rename = "section")]
    sections: Vec<SectionSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SectionSpec {
    name: String,
    #[serde(default)]
    doc: Option<String>,
    #[serde(default, rename = "field")]
    fields: Vec<FieldSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FieldSpec {
    name: String,
    kind: String,
    #[serde(default)]
    secret: bool,
    #[serde(default)]
    help: Option<String>,
    #[serde(default)]
    default: Option<toml::Value>,
    #[serde(default)]
    min_length: Option<usize>,
    #[serde(default)]
    max_length: Option<usize>,
    #[serde(default)]
    min: Option<i64>,
    #[serde(default)]
    max: Option<i64>,
    #[serde(default)]
    lowercase: bool,
    #[serde(default)]
    hostname: bool,
    #[serde(default)]
    item_kind: Option<String>,
    #[serde(default = "default_separator")]
    separator: String,
    #[serde(default)]
    min_items: Option<usize>,
    #[serde(default)]
    max_items: Option<usize>,
    #[serde(default)]
    ca_field: Option<String>,
    #[serde(default)]
    hostname_field: Option<String>,
    #[serde(default)]
    services: Option<ServicesRepr>,
}

/// Parse sections from manifest text.
pub fn parse_sections(text: &str) -> Result<Vec<Section>> {
    let manifest: Manifest = toml::from_str(text)?;
    manifest.sections.into_iter().map(SectionSpec::build).collect()
}

/// Read and parse a manifest file.
pub fn load_sections(path: impl AsRef<Path>) -> Result<Vec<Section>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| errors::io_error("read_manifest", path, e))?;
    parse_sections(&text)
}

impl SectionSpec {
    fn build(self) -> Result<Section> {
        let mut section = Section::new(self.name);
        if let Some(doc) = self.doc {
            section = section.doc(doc);
        }
        for spec in self.fields {
            section = section.field(spec.build()?);
        }
        Ok(section)
    }
}

fn scalar_kind(name: &str, kind: &str) -> Result<Box<dyn FieldKind>> {
    Ok(match kind {
        "string" => Box::new(StringKind),
        "integer" => Box::new(IntegerKind),
        "boolean" => Box::new(BooleanKind),
        "email" => Box::new(EmailKind),
        other => {
            return Err(errors::improperly_configured(
                "parse_manifest",
                format!("unknown kind {other:?} for {name}"),
            ))
        }
    })
}

impl FieldSpec {
    fn validators(&self) -> Vec<Box<dyn Validator>> {
        let mut validators: Vec<Box<dyn Validator>> = Vec::new();
        if let Some(n) = self.min_length {
            validators.push(Box::new(crate::validation::MinLength(n)));
        }
        if let Some(n) = self.max_length {
            validators.push(Box::new(crate::validation::MaxLength(n)));
        }
        if self.min.is_some() || self.max.is_some() {
            validators.push(Box::new(IntRange {
                min: self.min,
                max: self.max,
            }));
        }
        if self.lowercase {
            validators.push(Box::new(LowercaseOnly));
        }
        if self.hostname {
            validators.push(Box::new(HostName));
        }
        validators
    }

    fn certificate_validator(&self) -> CertificateValidator {
        let mut validator = CertificateValidator::new();
        if let Some(ca) = &self.ca_field {
            validator = validator.ca_field(ca.as_str());
        }
        if let Some(host) = &self.hostname_field {
            validator = validator.hostname_field(host.as_str());
        }
        validator
    }

    fn kind(&self) -> Result<(Box<dyn FieldKind>, bool)> {
        // The bool says whether validators attach to list items.
        Ok(match self.kind.as_str() {
            "file" => (Box::new(FileKind), false),
            "private_key" => (Box::new(PrivateKeyKind), false),
            "certificate" => (Box::new(CertificateKind::new(self.certificate_validator())), false),
            "list" | "string_list" | "integer_list" => {
                let item = match self.kind.as_str() {
                    "string_list" => "string",
                    "integer_list" => "integer",
                    _ => self.item_kind.as_deref().unwrap_or("string"),
                };
                let mut list = ListKind::boxed(scalar_kind(&self.name, item)?)
                    .separator(self.separator.clone());
                if let Some(n) = self.min_items {
                    list = list.min_items(n);
                }
                if let Some(n) = self.max_items {
                    list = list.max_items(n);
                }
                for validator in self.validators() {
                    list = list.boxed_item_validator(validator);
                }
                (Box::new(list), true)
            }
            other => (scalar_kind(&self.name, other)?, false),
        })
    }

    fn default_value(&self, kind: &dyn FieldKind) -> Result<Option<Value>> {
        let Some(default) = &self.default else {
            return Ok(None);
        };
        let sep = self.separator.as_str();
        let raw = toml_to_stream(default, sep).ok_or_else(|| {
            errors::improperly_configured(
                "parse_manifest",
                format!("unsupported default for {}", self.name),
            )
        })?;
        kind.from_stream(raw.as_bytes()).map(Some).map_err(|_| {
            errors::improperly_configured(
                "parse_manifest",
                format!("default of {} does not match its kind", self.name),
            )
        })
    }

    fn build(self) -> Result<Field> {
        let (kind, item_validators) = self.kind()?;
        kind.check()?;
        let default = self.default_value(kind.as_ref())?;
        let secret = self.secret || kind.requires_secret();
        let mut field = Field::with_kind(self.name.clone(), kind).set_secret(secret);
        if !item_validators {
            for validator in self.validators() {
                field = field.boxed_validator(validator);
            }
        }
        if let Some(default) = default {
            field = field.default(default);
        }
        if let Some(help) = self.help {
            field = field.help(help);
        }
        if let Some(services) = self.services {
            field = field.services(Services::from(services));
        }
        Ok(field)
    }
}

fn toml_to_stream(value: &toml::Value, separator: &str) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Array(items) => items
            .iter()
            .map(|item| toml_to_stream(item, separator))
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.join(separator)),
        _ => None,
    }
}
