//! Per-field merge of the three configuration layers.
//!
//! Precedence is flags > file > defaults, decided field by field. A layer
//! only ever writes the fields it actually carries, so a file that sets
//! `server.port` leaves `server.host` at whatever the lower layer said.

use std::{fs, path::Path};

use serde_yaml::{Mapping, Value};

use crate::{
    config::{Config, Field, FieldKind, FieldValue},
    flags::FlagValues,
    server::error::{LockboxError, Result},
};

/// The fields a configuration file explicitly sets, already type-checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileLayer {
    origin: String,
    values: Vec<(Field, FieldValue)>,
}

impl FileLayer {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let origin = path.to_string_lossy().to_string();
        let content = fs::read_to_string(path).map_err(|source| LockboxError::ConfigIo {
            path: origin.clone(),
            source,
        })?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        if is_toml {
            Self::from_toml_str(&content, origin)
        } else {
            Self::from_yaml_str(&content, origin)
        }
    }

    pub fn from_yaml_str(input: &str, origin: impl Into<String>) -> Result<Self> {
        let origin = origin.into();
        if input.trim().is_empty() {
            return Ok(Self::empty(origin));
        }

        let document: Value = serde_yaml::from_str(input).map_err(|err| LockboxError::ConfigParse {
            path: origin.clone(),
            message: err.to_string(),
        })?;
        Self::from_document(document, origin)
    }

    pub fn from_toml_str(input: &str, origin: impl Into<String>) -> Result<Self> {
        let origin = origin.into();
        if input.trim().is_empty() {
            return Ok(Self::empty(origin));
        }

        let document: Value = toml::from_str(input).map_err(|err| LockboxError::ConfigParse {
            path: origin.clone(),
            message: err.to_string(),
        })?;
        Self::from_document(document, origin)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.values.iter().map(|(field, _)| *field)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn empty(origin: String) -> Self {
        Self {
            origin,
            values: Vec::new(),
        }
    }

    fn from_document(document: Value, origin: String) -> Result<Self> {
        let invalid = |message: String| LockboxError::ConfigParse {
            path: origin.clone(),
            message,
        };

        let sections = match document {
            Value::Null => return Ok(Self::empty(origin)),
            Value::Mapping(sections) => sections,
            _ => return Err(invalid("top level must be a mapping of sections".into())),
        };

        let mut values = Vec::new();
        for (section, body) in sections {
            let section = key_name(&section)
                .ok_or_else(|| invalid("section names must be strings".into()))?;
            if !Field::SECTIONS.contains(&section.as_str()) {
                return Err(invalid(format!("unknown section `{section}`")));
            }

            let entries: Mapping = match body {
                Value::Null => continue,
                Value::Mapping(entries) => entries,
                _ => return Err(invalid(format!("section `{section}` must be a mapping"))),
            };

            for (key, value) in entries {
                let key = key_name(&key)
                    .ok_or_else(|| invalid(format!("keys in `{section}` must be strings")))?;
                let field = Field::lookup(&section, &key)
                    .ok_or_else(|| invalid(format!("unknown field `{section}.{key}`")))?;

                if value.is_null() {
                    continue;
                }

                let converted = convert(field.kind(), &value).ok_or_else(|| {
                    invalid(format!("`{field}` must be {}", field.kind().expected()))
                })?;
                values.push((field, converted));
            }
        }

        Ok(Self { origin, values })
    }
}

fn key_name(key: &Value) -> Option<String> {
    key.as_str().map(str::to_string)
}

fn convert(kind: FieldKind, value: &Value) -> Option<FieldValue> {
    match (kind, value) {
        (FieldKind::Str, Value::String(s)) => Some(FieldValue::Str(s.clone())),
        (FieldKind::Str, Value::Number(n)) => Some(FieldValue::Str(n.to_string())),
        (FieldKind::Str, Value::Bool(b)) => Some(FieldValue::Str(b.to_string())),
        (FieldKind::Int, Value::Number(n)) => n
            .as_u64()
            .filter(|v| u16::try_from(*v).is_ok())
            .map(FieldValue::Int),
        (FieldKind::Bool, Value::Bool(b)) => Some(FieldValue::Bool(*b)),
        _ => None,
    }
}

/// Merges `file` and then `flags` over `defaults`.
pub fn resolve(defaults: Config, file: Option<&FileLayer>, flags: &FlagValues) -> Result<Config> {
    let mut config = defaults;

    if let Some(layer) = file {
        for (field, value) in &layer.values {
            config
                .assign(*field, value.clone())
                .map_err(|expected| LockboxError::ConfigParse {
                    path: layer.origin.clone(),
                    message: format!("`{field}` must be {expected}"),
                })?;
        }
    }

    for (descriptor, raw) in flags.iter() {
        let field = descriptor.field;
        let invalid = || LockboxError::InvalidFlagValue {
            flag: descriptor.name.to_string(),
            value: raw.to_string(),
            expected: field.kind().expected(),
        };
        let value = field.kind().parse(raw).ok_or_else(invalid)?;
        config.assign(field, value).map_err(|_| invalid())?;
    }

    Ok(config)
}
