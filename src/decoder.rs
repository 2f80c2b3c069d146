//! Runtime validation of untyped values.
//!
//! Cached values and data-source responses are untrusted JSON. A [`Decoder`]
//! turns such a value into a typed result or explains why it cannot.
//!
//! ```
//! use query_kit::decoder::{Decoder, Json};
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Deserialize)]
//! struct License {
//!     id: u32,
//!     title: String,
//! }
//!
//! let decoder = Json::<License>::named("License");
//! assert!(decoder.decode(&json!({"id": 1, "title": "title"})).is_ok());
//! assert!(decoder.decode(&json!({"id": 1, "titl": "wrong-field"})).is_err());
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;

/// One reason a value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Where in the value the problem is; `"$"` for the root.
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn root(message: impl Into<String>) -> Self {
        Self::new("$", message)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid value at \"{}\": {}", self.path, self.message)
    }
}

/// Render validation errors the way they appear in error events.
pub fn report(errors: &[ValidationError]) -> Vec<String> {
    errors.iter().map(ToString::to_string).collect()
}

/// Validates an untyped value and converts it to `T`.
pub trait Decoder<T>: Send + Sync {
    /// Identity of the decoder, recorded in diagnostics.
    fn name(&self) -> String;

    /// Decode `raw`.
    ///
    /// # Errors
    /// Returns every validation failure that was found.
    fn decode(&self, raw: &Value) -> Result<T, Vec<ValidationError>>;
}

/// Accepts anything and returns it unchanged.
///
/// Queries over untyped data use `type Result = Value` with this decoder.
/// Such caches cannot detect corruption.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unknown;

impl Decoder<Value> for Unknown {
    fn name(&self) -> String {
        "unknown".to_string()
    }

    fn decode(&self, raw: &Value) -> Result<Value, Vec<ValidationError>> {
        Ok(raw.clone())
    }
}

/// Decodes through `serde`.
pub struct Json<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Json<T> {
    /// Decoder named after the Rust type, module paths stripped.
    pub fn new() -> Self {
        Self::named(short_type_name(std::any::type_name::<T>()))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Json {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

/// `alloc::vec::Vec<app::License>` becomes `Vec<License>`.
fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut path = String::new();
    for c in full.chars() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            path.push(c);
        } else {
            out.push_str(last_segment(&path));
            path.clear();
            out.push(c);
        }
    }
    out.push_str(last_segment(&path));
    out
}

fn last_segment(path: &str) -> &str {
    path.rsplit("::").next().unwrap_or(path)
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder<T> for Json<T> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn decode(&self, raw: &Value) -> Result<T, Vec<ValidationError>> {
        T::deserialize(raw).map_err(|e| vec![ValidationError::root(e.to_string())])
    }
}

/// Wraps a decoder so that JSON `null` decodes to `None`.
///
/// Most lookups against the legacy backend return `null` for unknown ids.
pub struct Nullable<D> {
    inner: D,
}

impl<D> Nullable<D> {
    pub fn new(inner: D) -> Self {
        Nullable { inner }
    }
}

impl<T, D: Decoder<T>> Decoder<Option<T>> for Nullable<D> {
    fn name(&self) -> String {
        format!("{} | null", self.inner.name())
    }

    fn decode(&self, raw: &Value) -> Result<Option<T>, Vec<ValidationError>> {
        if raw.is_null() {
            Ok(None)
        } else {
            self.inner.decode(raw).map(Some)
        }
    }
}

/// Narrows another decoder with a predicate.
///
/// Used with `Query::query_with_decoder` to read a subset of what a query
/// normally accepts, e.g. only licenses of one instance.
pub struct Refine<D, F> {
    inner: D,
    name: String,
    check: F,
}

impl<D, F> Refine<D, F> {
    pub fn new(inner: D, name: impl Into<String>, check: F) -> Self {
        Refine {
            inner,
            name: name.into(),
            check,
        }
    }
}

impl<T, D, F> Decoder<T> for Refine<D, F>
where
    D: Decoder<T>,
    F: Fn(&T) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn decode(&self, raw: &Value) -> Result<T, Vec<ValidationError>> {
        let value = self.inner.decode(raw)?;
        (self.check)(&value).map_err(|msg| vec![ValidationError::root(msg)])?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct License {
        id: u32,
        title: String,
    }

    #[test]
    fn test_unknown_accepts_everything() {
        for raw in [json!(null), json!(1), json!({"any": ["thing"]})] {
            assert_eq!(Unknown.decode(&raw), Ok(raw.clone()));
        }
    }

    #[test]
    fn test_json_decoder_name_of_generic_type() {
        assert_eq!(Json::<Vec<License>>::new().name(), "Vec<License>");
        assert_eq!(Json::<Option<String>>::new().name(), "Option<String>");
        assert_eq!(
            Json::<std::collections::HashMap<String, License>>::new().name(),
            "HashMap<String, License>"
        );
    }

    #[test]
    fn test_json_decoder_reports_missing_field() {
        let decoder = Json::<License>::new();
        assert_eq!(decoder.name(), "License");

        let errors = decoder
            .decode(&json!({"id": 1, "titl": "wrong-field"}))
            .expect_err("must fail");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "$");
        assert!(errors[0].message.contains("title"), "{}", errors[0]);
    }

    #[test]
    fn test_nullable_decoder() {
        let decoder = Nullable::new(Json::<License>::named("License"));
        assert_eq!(decoder.name(), "License | null");
        assert_eq!(decoder.decode(&Value::Null), Ok(None));
        assert_eq!(
            decoder.decode(&json!({"id": 2, "title": "t"})),
            Ok(Some(License {
                id: 2,
                title: "t".to_string()
            }))
        );
        assert!(decoder.decode(&json!("nope")).is_err());
    }

    #[test]
    fn test_refine_decoder() {
        let decoder = Refine::new(Json::<License>::new(), "EvenLicense", |l: &License| {
            if l.id % 2 == 0 {
                Ok(())
            } else {
                Err(format!("license {} has an odd id", l.id))
            }
        });

        assert!(decoder.decode(&json!({"id": 2, "title": "t"})).is_ok());
        let errors = decoder
            .decode(&json!({"id": 3, "title": "t"}))
            .expect_err("must fail");
        assert_eq!(
            report(&errors),
            vec!["Invalid value at \"$\": license 3 has an odd id"]
        );
    }
}
