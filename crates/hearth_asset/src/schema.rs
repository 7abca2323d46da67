//! Declarative asset codecs.
//!
//! An asset type describes itself as a vector of field specs (name,
//! kind, optional default, optional validator) built once at startup.
//! Decoding walks the spec against a JSON document; there is no
//! reflection anywhere.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::AssetError;
use crate::ident::Ident;

#[derive(Clone, PartialEq, Debug)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    StrList(Vec<String>),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Str,
    StrList,
}

impl FieldKind {
    fn expected(self) -> &'static str {
        match self {
            Self::Bool => "a boolean",
            Self::Int => "an integer",
            Self::Float => "a number",
            Self::Str => "a string",
            Self::StrList => "a list of strings",
        }
    }
}

/// Field-level constraints checked right after conversion.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Validator {
    /// Strings and lists must not be empty.
    NonEmpty,
    /// Numeric fields must be at least this value.
    Min(f64),
}

#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub default: Option<FieldValue>,
    pub validator: Option<Validator>,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            default: None,
            validator: None,
        }
    }

    pub fn optional(name: &'static str, kind: FieldKind, default: FieldValue) -> Self {
        Self {
            name,
            kind,
            default: Some(default),
            validator: None,
        }
    }

    pub fn validated(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct Schema {
    pub fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new(fields: impl Into<Vec<FieldSpec>>) -> Self {
        Self {
            fields: fields.into(),
        }
    }

    /// Decodes one JSON document against this schema. `kind` and `key`
    /// only flavor the error messages.
    pub fn decode(&self, kind: &str, key: &Ident, doc: &Value) -> Result<Fields, AssetError> {
        let object = doc.as_object().ok_or_else(|| AssetError::Decode {
            kind: kind.to_owned(),
            key: key.to_string(),
            source: anyhow::anyhow!("asset document is not an object"),
        })?;

        let mut fields = FxHashMap::default();

        for spec in &self.fields {
            let value = match object.get(spec.name) {
                Some(raw) => convert(raw, spec.kind).ok_or_else(|| AssetError::TypeMismatch {
                    kind: kind.to_owned(),
                    key: key.to_string(),
                    field: spec.name,
                    expected: spec.kind.expected(),
                })?,
                None => match &spec.default {
                    Some(default) => default.clone(),
                    None => {
                        return Err(AssetError::MissingField {
                            kind: kind.to_owned(),
                            key: key.to_string(),
                            field: spec.name,
                        })
                    }
                },
            };

            if let Some(validator) = spec.validator {
                validate(&value, validator).map_err(|reason| AssetError::Validation {
                    kind: kind.to_owned(),
                    key: key.to_string(),
                    field: spec.name,
                    reason,
                })?;
            }

            fields.insert(spec.name, value);
        }

        Ok(Fields(fields))
    }
}

fn convert(raw: &Value, kind: FieldKind) -> Option<FieldValue> {
    Some(match kind {
        FieldKind::Bool => FieldValue::Bool(raw.as_bool()?),
        FieldKind::Int => FieldValue::Int(raw.as_i64()?),
        FieldKind::Float => FieldValue::Float(raw.as_f64()?),
        FieldKind::Str => FieldValue::Str(raw.as_str()?.to_owned()),
        FieldKind::StrList => FieldValue::StrList(
            raw.as_array()?
                .iter()
                .map(|v| v.as_str().map(str::to_owned))
                .collect::<Option<_>>()?,
        ),
    })
}

fn validate(value: &FieldValue, validator: Validator) -> Result<(), String> {
    match (validator, value) {
        (Validator::NonEmpty, FieldValue::Str(s)) if s.is_empty() => {
            Err("must not be empty".into())
        }
        (Validator::NonEmpty, FieldValue::StrList(l)) if l.is_empty() => {
            Err("must not be empty".into())
        }
        (Validator::Min(min), FieldValue::Int(n)) if (*n as f64) < min => {
            Err(format!("must be at least {min}"))
        }
        (Validator::Min(min), FieldValue::Float(n)) if *n < min => {
            Err(format!("must be at least {min}"))
        }
        _ => Ok(()),
    }
}

/// A decoded document: field name to converted value.
#[derive(Clone, Debug, Default)]
pub struct Fields(FxHashMap<&'static str, FieldValue>);

impl Fields {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    pub fn bool(&self, name: &str) -> anyhow::Result<bool> {
        match self.get(name) {
            Some(FieldValue::Bool(v)) => Ok(*v),
            other => anyhow::bail!("field '{name}' is not a bool: {other:?}"),
        }
    }

    pub fn int(&self, name: &str) -> anyhow::Result<i64> {
        match self.get(name) {
            Some(FieldValue::Int(v)) => Ok(*v),
            other => anyhow::bail!("field '{name}' is not an integer: {other:?}"),
        }
    }

    pub fn float(&self, name: &str) -> anyhow::Result<f64> {
        match self.get(name) {
            Some(FieldValue::Float(v)) => Ok(*v),
            Some(FieldValue::Int(v)) => Ok(*v as f64),
            other => anyhow::bail!("field '{name}' is not a number: {other:?}"),
        }
    }

    pub fn str(&self, name: &str) -> anyhow::Result<&str> {
        match self.get(name) {
            Some(FieldValue::Str(v)) => Ok(v),
            other => anyhow::bail!("field '{name}' is not a string: {other:?}"),
        }
    }

    pub fn str_list(&self, name: &str) -> anyhow::Result<&[String]> {
        match self.get(name) {
            Some(FieldValue::StrList(v)) => Ok(v),
            other => anyhow::bail!("field '{name}' is not a string list: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            FieldSpec::required("flow_rate", FieldKind::Int).validated(Validator::Min(1.0)),
            FieldSpec::optional("can_demote", FieldKind::Bool, FieldValue::Bool(true)),
            FieldSpec::required("texture", FieldKind::Str).validated(Validator::NonEmpty),
        ])
    }

    fn key() -> Ident {
        Ident::new("hearth:water").unwrap()
    }

    #[test]
    fn defaults_fill_missing_optionals() {
        let doc = json!({"flow_rate": 5, "texture": "water.png"});
        let fields = schema().decode("fluid", &key(), &doc).unwrap();

        assert_eq!(fields.int("flow_rate").unwrap(), 5);
        assert!(fields.bool("can_demote").unwrap());
    }

    #[test]
    fn missing_required_field_fails() {
        let doc = json!({"texture": "water.png"});
        assert!(matches!(
            schema().decode("fluid", &key(), &doc),
            Err(AssetError::MissingField {
                field: "flow_rate",
                ..
            })
        ));
    }

    #[test]
    fn validators_run_after_conversion() {
        let doc = json!({"flow_rate": 0, "texture": "water.png"});
        assert!(matches!(
            schema().decode("fluid", &key(), &doc),
            Err(AssetError::Validation { .. })
        ));

        let doc = json!({"flow_rate": 5, "texture": ""});
        assert!(matches!(
            schema().decode("fluid", &key(), &doc),
            Err(AssetError::Validation { .. })
        ));
    }

    #[test]
    fn type_mismatch_names_the_expectation() {
        let doc = json!({"flow_rate": "fast", "texture": "water.png"});
        assert!(matches!(
            schema().decode("fluid", &key(), &doc),
            Err(AssetError::TypeMismatch {
                expected: "an integer",
                ..
            })
        ));
    }
}
