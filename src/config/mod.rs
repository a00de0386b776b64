//! # Bootstrap Configuration
//!
//! Loads and validates the xDS bootstrap document: the management-server
//! bindings, the node identity attached to the first request on every
//! stream, per-authority overrides, and the certificate-provider
//! declarations that cluster TLS configs are checked against.
//!
//! The bootstrap is a single JSON document. It is located, in order, from:
//! 1. the file named by the `MESHWIRE_BOOTSTRAP` environment variable,
//! 2. the inline JSON in `MESHWIRE_BOOTSTRAP_CONFIG`,
//! or supplied directly by the caller. Bootstrap errors are fatal at client
//! construction; the bootstrap is never hot-reloaded.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{MeshwireError, Result};

/// Environment variable naming the bootstrap file path.
pub const BOOTSTRAP_FILE_ENV: &str = "MESHWIRE_BOOTSTRAP";

/// Environment variable carrying the bootstrap JSON inline.
pub const BOOTSTRAP_CONFIG_ENV: &str = "MESHWIRE_BOOTSTRAP_CONFIG";

/// Top-level bootstrap document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bootstrap {
    /// Management servers for the default (empty) authority, in preference
    /// order. Only the first entry is used; the list shape is kept for
    /// compatibility with existing bootstrap files.
    #[serde(default)]
    pub xds_servers: Vec<XdsServerConfig>,

    /// Node identity reported to the management server.
    #[serde(default)]
    pub node: Option<BootstrapNode>,

    /// Per-authority overrides for `xdstp://` resource names.
    #[serde(default)]
    pub authorities: HashMap<String, Authority>,

    /// Certificate-provider plugin declarations, referenced by name from
    /// cluster TLS configs.
    #[serde(default)]
    pub certificate_providers: HashMap<String, CertificateProviderConfig>,
}

/// A single management-server binding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XdsServerConfig {
    /// Target URI, e.g. `dns:///xds.example.org:443` or `127.0.0.1:18000`.
    pub server_uri: String,

    /// Channel credential candidates, in preference order. The first
    /// supported type wins.
    #[serde(default)]
    pub channel_creds: Vec<ChannelCreds>,

    /// Optional server feature strings. Recognized: `ignore_resource_deletion`.
    /// Unknown features are ignored.
    #[serde(default)]
    pub server_features: Vec<String>,
}

impl XdsServerConfig {
    /// Stable identity for channel sharing and LRS server matching.
    pub fn key(&self) -> String {
        let creds = self.channel_creds.first().map(|c| c.r#type.as_str()).unwrap_or("insecure");
        format!("{}#{}", self.server_uri, creds)
    }

    pub fn ignores_resource_deletion(&self) -> bool {
        self.server_features.iter().any(|f| f == "ignore_resource_deletion")
    }
}

/// A channel credential candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelCreds {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

const SUPPORTED_CHANNEL_CREDS: &[&str] = &["insecure", "tls", "google_default"];

/// Node identity attached to the first request on every ADS/LRS stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapNode {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub locality: Option<BootstrapLocality>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Node locality: compared lexicographically as (region, zone, sub_zone).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapLocality {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub sub_zone: String,
}

/// Per-authority overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Authority {
    /// Management servers for this authority. Empty means: use the
    /// top-level `xds_servers`.
    #[serde(default)]
    pub xds_servers: Vec<XdsServerConfig>,

    /// Template used to expand old-style listener names under this
    /// authority. Retained for bootstrap compatibility; not interpreted by
    /// the core.
    #[serde(default)]
    pub client_listener_resource_name_template: Option<String>,
}

/// A certificate-provider plugin declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificateProviderConfig {
    pub plugin_name: String,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

impl Bootstrap {
    /// Load the bootstrap from the environment (`MESHWIRE_BOOTSTRAP` file
    /// path, falling back to `MESHWIRE_BOOTSTRAP_CONFIG` inline JSON).
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = std::env::var(BOOTSTRAP_FILE_ENV) {
            return Self::from_file(path);
        }
        if let Ok(contents) = std::env::var(BOOTSTRAP_CONFIG_ENV) {
            return Self::from_json(&contents);
        }
        Err(MeshwireError::bootstrap(format!(
            "bootstrap not found: neither {} nor {} is set",
            BOOTSTRAP_FILE_ENV, BOOTSTRAP_CONFIG_ENV
        )))
    }

    /// Load the bootstrap from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MeshwireError::bootstrap_with_source(
                format!("failed to read bootstrap file '{}'", path.display()),
                Box::new(e),
            )
        })?;
        Self::from_json(&contents)
    }

    /// Parse the bootstrap from a JSON string and validate it.
    pub fn from_json(contents: &str) -> Result<Self> {
        let bootstrap: Bootstrap = serde_json::from_str(contents).map_err(|e| {
            MeshwireError::bootstrap_with_source("failed to parse bootstrap JSON", Box::new(e))
        })?;
        bootstrap.validate()?;
        Ok(bootstrap)
    }

    /// Validate the bootstrap document.
    pub fn validate(&self) -> Result<()> {
        if self.xds_servers.is_empty() {
            return Err(MeshwireError::bootstrap("\"xds_servers\" array is empty"));
        }
        for (i, server) in self.xds_servers.iter().enumerate() {
            server.validate(&format!("xds_servers[{}]", i))?;
        }
        for (name, authority) in &self.authorities {
            for (i, server) in authority.xds_servers.iter().enumerate() {
                server.validate(&format!("authorities[\"{}\"].xds_servers[{}]", name, i))?;
            }
        }
        for (name, provider) in &self.certificate_providers {
            if provider.plugin_name.is_empty() {
                return Err(MeshwireError::bootstrap(format!(
                    "certificate_providers[\"{}\"]: plugin_name is empty",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Resolve the server binding for an authority (empty string selects the
    /// default top-level servers).
    pub fn servers_for_authority(&self, authority: &str) -> Result<&XdsServerConfig> {
        if authority.is_empty() {
            return Ok(&self.xds_servers[0]);
        }
        let entry = self.authorities.get(authority).ok_or_else(|| {
            MeshwireError::bootstrap(format!("authority \"{}\" not present in bootstrap", authority))
        })?;
        Ok(entry.xds_servers.first().unwrap_or(&self.xds_servers[0]))
    }

    /// Whether a certificate-provider instance name is declared.
    pub fn has_certificate_provider(&self, instance_name: &str) -> bool {
        self.certificate_providers.contains_key(instance_name)
    }

    /// Build the Envoy `Node` proto reported on stream establishment.
    pub fn node_proto(&self) -> envoy_types::pb::envoy::config::core::v3::Node {
        use envoy_types::pb::envoy::config::core::v3::{Locality, Node};

        let node = self.node.clone().unwrap_or_default();
        Node {
            id: node.id,
            cluster: node.cluster,
            locality: node.locality.map(|l| Locality {
                region: l.region,
                zone: l.zone,
                sub_zone: l.sub_zone,
            }),
            metadata: node.metadata.as_ref().map(json_to_proto_struct),
            user_agent_name: crate::APP_NAME.to_string(),
            ..Default::default()
        }
    }
}

impl XdsServerConfig {
    fn validate(&self, context: &str) -> Result<()> {
        if self.server_uri.is_empty() {
            return Err(MeshwireError::bootstrap(format!("{}: server_uri is empty", context)));
        }
        if !self.channel_creds.is_empty()
            && !self
                .channel_creds
                .iter()
                .any(|c| SUPPORTED_CHANNEL_CREDS.contains(&c.r#type.as_str()))
        {
            return Err(MeshwireError::bootstrap(format!(
                "{}: no supported channel_creds type (supported: {})",
                context,
                SUPPORTED_CHANNEL_CREDS.join(", ")
            )));
        }
        Ok(())
    }
}

/// Convert a JSON object into a protobuf `Struct` for node metadata.
fn json_to_proto_struct(
    value: &serde_json::Value,
) -> envoy_types::pb::google::protobuf::Struct {
    use envoy_types::pb::google::protobuf::Struct;

    let fields = match value {
        serde_json::Value::Object(map) => {
            map.iter().map(|(k, v)| (k.clone(), json_to_proto_value(v))).collect()
        }
        _ => Default::default(),
    };
    Struct { fields }
}

fn json_to_proto_value(value: &serde_json::Value) -> envoy_types::pb::google::protobuf::Value {
    use envoy_types::pb::google::protobuf::{value::Kind, ListValue, Value};

    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(json_to_proto_value).collect(),
        }),
        serde_json::Value::Object(_) => Kind::StructValue(json_to_proto_struct(value)),
    };
    Value { kind: Some(kind) }
}
