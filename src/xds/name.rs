//! Resource-name handling.
//!
//! A resource name is the pair `(authority, key)`. Plain names ("old
//! style") resolve under the default, empty authority. `xdstp://` URIs
//! carry an explicit authority segment:
//!
//! ```text
//! xdstp://<authority>/<resource type path>/<id>[?<context params>]
//! ```
//!
//! Context parameters are sorted when canonicalizing so that equivalent
//! names hit the same cache entry and appear identically on the wire.

use url::Url;

use crate::errors::{MeshwireError, Result};

pub const XDSTP_SCHEME: &str = "xdstp";

/// Parsed resource name. `key` is the part used for cache lookups within
/// `(type, authority)`; for old-style names it is the name itself, for
/// `xdstp` names it is `<id>[?<sorted context params>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XdsResourceName {
    pub authority: String,
    pub key: String,
}

impl XdsResourceName {
    /// Parse a resource name for a resource type identified by its proto
    /// path (e.g. `envoy.config.listener.v3.Listener`).
    pub fn parse(name: &str, type_path: &str) -> Result<Self> {
        if !name.starts_with("xdstp:") {
            return Ok(Self { authority: String::new(), key: name.to_string() });
        }
        let url = Url::parse(name)
            .map_err(|e| MeshwireError::parse_with_source(
                format!("invalid xdstp resource name '{}'", name),
                Box::new(e),
            ))?;
        if url.scheme() != XDSTP_SCHEME {
            return Err(MeshwireError::parse(format!(
                "invalid resource name scheme '{}' in '{}'",
                url.scheme(),
                name
            )));
        }
        let authority = url.host_str().unwrap_or("").to_string();
        let path = url.path().trim_start_matches('/');
        let (path_type, id) = match path.split_once('/') {
            Some((t, id)) if !id.is_empty() => (t, id),
            _ => {
                return Err(MeshwireError::parse(format!(
                    "xdstp resource name '{}' missing resource id",
                    name
                )))
            }
        };
        if path_type != type_path {
            return Err(MeshwireError::parse(format!(
                "xdstp resource name '{}' is of type '{}', expected '{}'",
                name, path_type, type_path
            )));
        }
        let key = match url.query() {
            None | Some("") => id.to_string(),
            Some(query) => {
                let mut params: Vec<&str> = query.split('&').collect();
                params.sort_unstable();
                format!("{}?{}", id, params.join("&"))
            }
        };
        Ok(Self { authority, key })
    }

    /// Reconstruct the canonical wire name for this `(authority, key)`
    /// under the given type path.
    pub fn canonical_wire_name(&self, type_path: &str) -> String {
        if self.authority.is_empty() {
            return self.key.clone();
        }
        format!("xdstp://{}/{}/{}", self.authority, type_path, self.key)
    }
}
