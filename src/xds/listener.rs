//! Listener resource validation using envoy-types.
//!
//! A client-side ("API") listener embeds an HTTP connection manager, which
//! carries the route configuration (inline or by RDS name), the ordered
//! HTTP filter chain, and an optional max-stream-duration. Server-side
//! listeners are identified by their address and otherwise passed through;
//! their filter-chain maps are outside this crate's scope.

use std::sync::Arc;
use std::time::Duration;

use envoy_types::pb::envoy::config::core::v3::config_source::ConfigSourceSpecifier;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::RouteSpecifier as ProtoRouteSpecifier,
    http_filter::ConfigType as ProtoFilterConfigType, HttpConnectionManager,
};
use envoy_types::pb::google::protobuf::Any as ProtoAny;
use prost::Message;

use super::filters::{proto_type_path, HttpFilterDescriptor, HttpFilterRegistry};
use super::resource_type::ResourceType;
use super::route::{validate_route_config, RouteConfigResource};
use super::validation::{validate_proto_duration, DecodeContext, ValidationErrors};

pub const HTTP_CONNECTION_MANAGER_TYPE: &str =
    "envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";

/// Validated Listener resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerResource {
    /// Client-side listener with an inlined HTTP connection manager.
    ApiListener(HttpConnectionManagerConfig),
    /// Server-side listener, retained for identification only.
    TcpListener { address: String },
}

/// Validated HTTP connection manager config.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpConnectionManagerConfig {
    pub route_specifier: ListenerRouteSpecifier,
    /// Ordered filter chain; always ends with the terminal router filter.
    pub http_filters: Vec<HttpFilterConfig>,
    pub http_max_stream_duration: Option<Duration>,
}

/// Where the connection manager gets its routes.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerRouteSpecifier {
    /// Fetch a RouteConfiguration resource under this name.
    Rds { name: String },
    /// Route configuration inlined into the listener.
    Inline(Arc<RouteConfigResource>),
}

/// A validated, identified HTTP filter entry.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpFilterConfig {
    pub name: String,
    pub descriptor: &'static HttpFilterDescriptor,
    /// Raw filter payload; the core identifies filters but does not
    /// interpret their configs.
    pub config: ProtoAny,
}

impl ResourceType for ListenerResource {
    const TYPE_PATH: &'static str = "envoy.config.listener.v3.Listener";
    const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = true;

    type Proto = Listener;
    type Resource = ListenerResource;

    fn proto_resource_name(proto: &Listener) -> String {
        proto.name.clone()
    }

    fn validate(
        ctx: &DecodeContext<'_>,
        proto: Listener,
    ) -> Result<ListenerResource, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let has_api_listener = proto.api_listener.is_some();
        let has_address = proto.address.is_some();
        if has_api_listener && has_address {
            errors.add("Listener has both address and ApiListener");
            return Err(errors);
        }
        if !has_api_listener && !has_address {
            errors.add("Listener has neither address nor ApiListener");
            return Err(errors);
        }

        if let Some(api_listener) = proto.api_listener {
            let hcm = errors.scoped("api_listener.api_listener", |errors| {
                decode_http_connection_manager(api_listener.api_listener.as_ref(), errors)
            });
            let config = match hcm {
                Some(hcm) => errors.scoped("api_listener.api_listener", |errors| {
                    validate_http_connection_manager(ctx, hcm, errors)
                }),
                None => None,
            };
            return match config {
                Some(config) if errors.is_empty() => Ok(ListenerResource::ApiListener(config)),
                _ => Err(errors),
            };
        }

        // Server-side listener: keep the address for identification.
        let address = super::endpoint::socket_address_string(proto.address.as_ref());
        match address {
            Some(address) => errors.into_result(ListenerResource::TcpListener { address }),
            None => {
                errors.add_at("address", "expected SocketAddress with a port value");
                Err(errors)
            }
        }
    }
}

fn decode_http_connection_manager(
    any: Option<&ProtoAny>,
    errors: &mut ValidationErrors,
) -> Option<HttpConnectionManager> {
    let any = match any {
        Some(any) => any,
        None => {
            errors.add("field not set");
            return None;
        }
    };
    let type_path = proto_type_path(&any.type_url);
    if type_path != HTTP_CONNECTION_MANAGER_TYPE {
        errors.add(format!("unsupported ApiListener type '{}'", type_path));
        return None;
    }
    match HttpConnectionManager::decode(&any.value[..]) {
        Ok(hcm) => Some(hcm),
        Err(e) => {
            errors.add(format!("could not parse HttpConnectionManager config: {}", e));
            None
        }
    }
}

fn validate_http_connection_manager(
    ctx: &DecodeContext<'_>,
    hcm: HttpConnectionManager,
    errors: &mut ValidationErrors,
) -> Option<HttpConnectionManagerConfig> {
    let route_specifier = errors.scoped("route_specifier", |errors| {
        validate_route_specifier(ctx, hcm.route_specifier, errors)
    });

    let http_filters = errors.scoped("http_filters", |errors| {
        validate_http_filters(ctx, hcm.http_filters, errors)
    });

    let http_max_stream_duration = hcm
        .common_http_protocol_options
        .as_ref()
        .and_then(|options| options.max_stream_duration.as_ref())
        .and_then(|duration| {
            errors.scoped("common_http_protocol_options.max_stream_duration", |errors| {
                validate_proto_duration(duration, errors)
            })
        });

    let route_specifier = route_specifier?;
    Some(HttpConnectionManagerConfig {
        route_specifier,
        http_filters: http_filters.unwrap_or_default(),
        http_max_stream_duration,
    })
}

fn validate_route_specifier(
    ctx: &DecodeContext<'_>,
    specifier: Option<ProtoRouteSpecifier>,
    errors: &mut ValidationErrors,
) -> Option<ListenerRouteSpecifier> {
    match specifier {
        Some(ProtoRouteSpecifier::Rds(rds)) => {
            if rds.route_config_name.is_empty() {
                errors.add_at("rds.route_config_name", "must be non-empty");
                return None;
            }
            let config_source_ok = match rds.config_source.as_ref() {
                Some(source) => matches!(
                    source.config_source_specifier,
                    Some(ConfigSourceSpecifier::Ads(_)) | Some(ConfigSourceSpecifier::Self_(_))
                ),
                None => false,
            };
            if !config_source_ok {
                errors.add_at("rds.config_source", "ConfigSource must specify ADS or SELF");
                return None;
            }
            Some(ListenerRouteSpecifier::Rds { name: rds.route_config_name })
        }
        Some(ProtoRouteSpecifier::RouteConfig(route_config)) => errors
            .scoped("route_config", |errors| {
                match validate_route_config(ctx, route_config) {
                    Ok(resource) => Some(ListenerRouteSpecifier::Inline(Arc::new(resource))),
                    Err(inner) => {
                        for (field, message) in inner.entries() {
                            if field.is_empty() {
                                errors.add(message);
                            } else {
                                errors.add_at(field, message);
                            }
                        }
                        None
                    }
                }
            }),
        Some(ProtoRouteSpecifier::ScopedRoutes(_)) => {
            errors.add("ScopedRoutes is not supported");
            None
        }
        None => {
            errors.add("one of Rds or RouteConfig must be set");
            None
        }
    }
}

fn validate_http_filters(
    ctx: &DecodeContext<'_>,
    filters: Vec<envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpFilter>,
    errors: &mut ValidationErrors,
) -> Option<Vec<HttpFilterConfig>> {
    if filters.is_empty() {
        errors.add("expected at least one filter");
        return None;
    }
    let registry = HttpFilterRegistry::new(&ctx.features);
    let num_filters = filters.len();
    let mut seen_names = std::collections::HashSet::new();
    let mut validated = Vec::with_capacity(num_filters);
    let error_count_before = errors.len();

    for (i, filter) in filters.into_iter().enumerate() {
        let is_last = i + 1 == num_filters;
        errors.scoped(format!("[{}]", i), |errors| {
            if filter.name.is_empty() {
                errors.add_at("name", "empty filter name");
                return;
            }
            if !seen_names.insert(filter.name.clone()) {
                errors.add_at("name", format!("duplicate HTTP filter name: {}", filter.name));
                return;
            }
            let config = match filter.config_type {
                Some(ProtoFilterConfigType::TypedConfig(any)) => any,
                _ => {
                    if filter.is_optional {
                        return;
                    }
                    errors.add_at("typed_config", "field not set");
                    return;
                }
            };
            let type_path = proto_type_path(&config.type_url);
            let descriptor = match registry.for_config_type(type_path) {
                Some(descriptor) => descriptor,
                None => {
                    if !filter.is_optional {
                        errors.add_at(
                            "typed_config",
                            format!("unsupported filter type '{}'", type_path),
                        );
                    }
                    return;
                }
            };
            if descriptor.is_terminal && !is_last {
                errors.add(format!(
                    "terminal filter '{}' must be in the last position in the filter chain",
                    filter.name
                ));
                return;
            }
            if !descriptor.is_terminal && is_last {
                errors.add(format!(
                    "non-terminal filter '{}' is the last filter in the chain",
                    filter.name
                ));
                return;
            }
            validated.push(HttpFilterConfig { name: filter.name, descriptor, config });
        });
    }

    if errors.len() > error_count_before {
        return None;
    }
    if validated.is_empty() || !validated.last().map(|f| f.descriptor.is_terminal).unwrap_or(false)
    {
        errors.add("the filter chain must end with a terminal filter");
        return None;
    }
    Some(validated)
}
