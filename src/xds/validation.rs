//! Validation support shared by the four resource validators: an error
//! accumulator that tracks the field path as a validator descends the
//! message, and the decode context (bootstrap handle plus static feature
//! toggles) validators consult.
//!
//! Validators do not short-circuit: every invariant violation in a payload
//! is reported, each with a json-pointer-style field path.

use std::fmt;

use crate::config::Bootstrap;

/// Static feature toggles passed into validators at client construction.
/// Mirrors the experimental environment flags of mature xDS stacks; all
/// default to off.
#[derive(Debug, Clone, Copy, Default)]
pub struct XdsFeatures {
    /// Accept `cluster_specifier_plugin` route actions (RLS).
    pub rls_cluster_specifier: bool,
    /// Keep cluster `override_host_status` sets and retain DRAINING
    /// endpoints with a status attribute.
    pub override_host_status: bool,
    /// Register the RBAC HTTP filter.
    pub rbac: bool,
}

/// Context available to validators while decoding a resource.
pub struct DecodeContext<'a> {
    pub bootstrap: &'a Bootstrap,
    pub features: XdsFeatures,
}

/// Accumulates `(field path, message)` pairs while a validator descends a
/// message. Scopes nest; errors recorded inside a scope carry the full
/// path down to the offending field.
#[derive(Debug, Default)]
pub struct ValidationErrors {
    path: Vec<String>,
    errors: Vec<(String, String)>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Run `f` with `field` appended to the current path.
    pub fn scoped<R>(&mut self, field: impl Into<String>, f: impl FnOnce(&mut Self) -> R) -> R {
        self.path.push(field.into());
        let result = f(self);
        self.path.pop();
        result
    }

    /// Record an error at the current path.
    pub fn add(&mut self, message: impl Into<String>) {
        self.errors.push((self.current_path(), message.into()));
    }

    /// Record an error at `field` under the current path.
    pub fn add_at(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.scoped(field, |errors| errors.add(message));
    }

    fn current_path(&self) -> String {
        let mut out = String::new();
        for segment in &self.path {
            if !out.is_empty() && !segment.starts_with('[') {
                out.push('.');
            }
            out.push_str(segment);
        }
        out
    }

    /// Finish validation: return `value` if nothing was recorded, otherwise
    /// the accumulated errors.
    pub fn into_result<T>(self, value: T) -> Result<T, ValidationErrors> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }

    /// Iterate over `(field path, message)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.errors.iter().map(|(f, m)| (f.as_str(), m.as_str()))
    }
}

/// Upper bound on proto durations accepted anywhere in a resource
/// (10,000 years, the protobuf `Duration` ceiling).
pub const MAX_DURATION_SECONDS: i64 = 315_576_000_000;

/// Validate a protobuf `Duration` and convert it. Records an error and
/// returns `None` when out of bounds.
pub(crate) fn validate_proto_duration(
    duration: &envoy_types::pb::google::protobuf::Duration,
    errors: &mut ValidationErrors,
) -> Option<std::time::Duration> {
    if duration.seconds < 0 || duration.seconds > MAX_DURATION_SECONDS {
        errors.add_at("seconds", "value must be in the range [0, 315576000000]");
        return None;
    }
    if duration.nanos < 0 || duration.nanos > 999_999_999 {
        errors.add_at("nanos", "value must be in the range [0, 999999999]");
        return None;
    }
    Some(std::time::Duration::new(duration.seconds as u64, duration.nanos as u32))
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, message) in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            if field.is_empty() {
                write!(f, "{}", message)?;
            } else {
                write!(f, "field:{} error:{}", field, message)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_nest_and_unwind() {
        let mut errors = ValidationErrors::new();
        errors.scoped("virtual_hosts", |errors| {
            errors.scoped("[0]", |errors| {
                errors.add_at("domains", "must be non-empty");
            });
        });
        errors.add("top-level problem");

        let entries: Vec<_> = errors.entries().collect();
        assert_eq!(entries[0], ("virtual_hosts[0].domains", "must be non-empty"));
        assert_eq!(entries[1], ("", "top-level problem"));
    }

    #[test]
    fn display_joins_entries() {
        let mut errors = ValidationErrors::new();
        errors.add_at("a", "one");
        errors.add_at("b", "two");
        assert_eq!(errors.to_string(), "field:a error:one; field:b error:two");
    }

    #[test]
    fn into_result_passes_value_through_when_clean() {
        let errors = ValidationErrors::new();
        assert_eq!(errors.into_result(42).unwrap(), 42);

        let mut errors = ValidationErrors::new();
        errors.add("boom");
        assert!(errors.into_result(42).is_err());
    }
}
