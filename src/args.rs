use std::{collections::BTreeMap, fmt};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ArgsError {
    #[error("invalid argument format: '{0}'. Expected 'key=value'")]
    InvalidFormat(String),
    #[error("unable to split arguments: {0}")]
    Split(#[from] shell_words::ParseError),
}

/// A constructor argument after best-effort numeric coercion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArgValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ArgValue {
    fn coerce(raw: &str) -> Self {
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(value) = raw.parse::<i64>() {
                return ArgValue::Int(value);
            }
        }
        match raw.parse::<f64>() {
            Ok(value) => ArgValue::Float(value),
            Err(_) => ArgValue::Str(raw.to_string()),
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Int(v) => write!(f, "{v}"),
            ArgValue::Float(v) => write!(f, "{v}"),
            ArgValue::Str(v) => write!(f, "{v:?}"),
        }
    }
}

/// Keyword arguments for a model constructor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DynamicArgs(BTreeMap<String, ArgValue>);

impl DynamicArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ArgValue) -> Option<ArgValue> {
        self.0.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, ArgValue)> for DynamicArgs {
    fn from_iter<I: IntoIterator<Item = (String, ArgValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parses `key=value` tokens; values may be quoted to embed whitespace.
pub fn parse_dynamic_args(raw: &str) -> Result<DynamicArgs, ArgsError> {
    debug!(raw, "parsing dynamic args");
    let tokens = shell_words::split(raw)?;

    let mut parsed = DynamicArgs::new();
    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            return Err(ArgsError::InvalidFormat(token));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ArgsError::InvalidFormat(token));
        }
        parsed.insert(key, ArgValue::coerce(value.trim()));
    }

    debug!(args = ?parsed, "parsed dynamic args");
    Ok(parsed)
}
