//! RouteConfiguration resource validation using envoy-types.
//!
//! A route configuration is an ordered list of virtual hosts, each with
//! domain patterns and routes. Routes that cannot match any
//! `/service/method` path are pruned silently; structural violations are
//! accumulated as validation errors. Virtual-host selection by domain
//! happens here as well, since its ranking rules belong to the resource.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use envoy_types::pb::envoy::config::core::v3::RuntimeFractionalPercent;
use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier, route, route_action, route_match,
    weighted_cluster, HeaderMatcher as ProtoHeaderMatcher, RetryPolicy as ProtoRetryPolicy,
    Route as ProtoRoute, RouteConfiguration, RouteMatch as ProtoRouteMatch,
    VirtualHost as ProtoVirtualHost,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, RegexMatcher, StringMatcher as ProtoStringMatcher,
};
use envoy_types::pb::envoy::r#type::v3::fractional_percent::DenominatorType;
use envoy_types::pb::google::protobuf::Any as ProtoAny;
use prost::Message;
use tracing::debug;

use super::filters::{proto_type_path, HttpFilterRegistry};
use super::matchers::{
    domain_matches, domain_pattern_type, DomainMatchType, HeaderMatcher, HeaderMatcherKind,
    SafeRegex, StringMatcher,
};
use super::resource_type::ResourceType;
use super::validation::{validate_proto_duration, DecodeContext, ValidationErrors};

/// Cluster-specifier plugin types the client understands. The payload is
/// retained, not interpreted.
const ROUTE_LOOKUP_CLUSTER_SPECIFIER_TYPE: &str = "grpc.lookup.v1.RouteLookupClusterSpecifier";

const FILTER_CONFIG_WRAPPER_TYPE: &str = "envoy.config.route.v3.FilterConfig";

/// Validated RouteConfiguration resource.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouteConfigResource {
    pub virtual_hosts: Vec<VirtualHost>,
    /// Referenced cluster-specifier plugins by name; unreferenced
    /// definitions are dropped during validation.
    pub cluster_specifier_plugins: BTreeMap<String, ClusterSpecifierPlugin>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSpecifierPlugin {
    pub plugin_type: String,
    pub config: ProtoAny,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VirtualHost {
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
    pub retry_policy: Option<RetryPolicy>,
    pub typed_per_filter_config: BTreeMap<String, FilterConfigOverride>,
}

/// Per-filter config override, keyed by filter name in the virtual host or
/// route that carries it.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfigOverride {
    pub filter_type: String,
    pub config: ProtoAny,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub matchers: RouteMatchers,
    pub action: RouteActionVariant,
    pub typed_per_filter_config: BTreeMap<String, FilterConfigOverride>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatchers {
    pub path_matcher: StringMatcher,
    pub header_matchers: Vec<HeaderMatcher>,
    /// Runtime-fraction selector normalized to parts-per-million.
    pub fraction_per_million: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteActionVariant {
    Forward(RouteAction),
    NonForwarding,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteAction {
    pub kind: RouteActionKind,
    pub hash_policies: Vec<HashPolicy>,
    pub retry_policy: Option<RetryPolicy>,
    pub max_stream_duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteActionKind {
    Cluster(String),
    WeightedClusters(Vec<ClusterWeight>),
    ClusterSpecifierPlugin(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterWeight {
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HashPolicy {
    pub kind: HashPolicyKind,
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HashPolicyKind {
    Header {
        header_name: String,
        regex: Option<SafeRegex>,
        regex_substitution: String,
    },
    ChannelId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub retry_on: Vec<RetryOn>,
    pub num_retries: u32,
    pub retry_back_off: RetryBackOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    Cancelled,
    DeadlineExceeded,
    Internal,
    ResourceExhausted,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackOff {
    pub base_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryBackOff {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(25),
            max_interval: Duration::from_millis(250),
        }
    }
}

impl ResourceType for RouteConfigResource {
    const TYPE_PATH: &'static str = "envoy.config.route.v3.RouteConfiguration";
    const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = false;

    type Proto = RouteConfiguration;
    type Resource = RouteConfigResource;

    fn proto_resource_name(proto: &RouteConfiguration) -> String {
        proto.name.clone()
    }

    fn validate(
        ctx: &DecodeContext<'_>,
        proto: RouteConfiguration,
    ) -> Result<RouteConfigResource, ValidationErrors> {
        validate_route_config(ctx, proto)
    }
}

/// Validate a RouteConfiguration payload. Also used directly by the
/// listener validator for inlined route configs.
pub(crate) fn validate_route_config(
    ctx: &DecodeContext<'_>,
    proto: RouteConfiguration,
) -> Result<RouteConfigResource, ValidationErrors> {
    let mut errors = ValidationErrors::new();

    let plugins = errors.scoped("cluster_specifier_plugins", |errors| {
        validate_cluster_specifier_plugins(ctx, proto.cluster_specifier_plugins, errors)
    });

    let mut virtual_hosts = Vec::with_capacity(proto.virtual_hosts.len());
    errors.scoped("virtual_hosts", |errors| {
        for (i, vhost) in proto.virtual_hosts.into_iter().enumerate() {
            errors.scoped(format!("[{}]", i), |errors| {
                if let Some(vhost) = validate_virtual_host(ctx, vhost, &plugins, errors) {
                    virtual_hosts.push(vhost);
                }
            });
        }
    });

    // Keep only the plugin definitions some surviving route references.
    let referenced: HashSet<&str> = virtual_hosts
        .iter()
        .flat_map(|vh| vh.routes.iter())
        .filter_map(|route| match &route.action {
            RouteActionVariant::Forward(action) => match &action.kind {
                RouteActionKind::ClusterSpecifierPlugin(name) => Some(name.as_str()),
                _ => None,
            },
            RouteActionVariant::NonForwarding => None,
        })
        .collect();
    let cluster_specifier_plugins = plugins
        .supported
        .into_iter()
        .filter(|(name, _)| referenced.contains(name.as_str()))
        .collect();

    errors.into_result(RouteConfigResource { virtual_hosts, cluster_specifier_plugins })
}

/// Plugin definitions split by whether the client understood them.
#[derive(Debug, Default)]
struct PluginSet {
    supported: BTreeMap<String, ClusterSpecifierPlugin>,
    /// Known-unsupported but optional: routes referencing these are pruned.
    optional_unsupported: HashSet<String>,
}

fn validate_cluster_specifier_plugins(
    ctx: &DecodeContext<'_>,
    plugins: Vec<envoy_types::pb::envoy::config::route::v3::ClusterSpecifierPlugin>,
    errors: &mut ValidationErrors,
) -> PluginSet {
    let mut set = PluginSet::default();
    if plugins.is_empty() {
        return set;
    }
    if !ctx.features.rls_cluster_specifier {
        debug!("ignoring cluster_specifier_plugins: RLS support disabled");
        return set;
    }
    for (i, plugin) in plugins.into_iter().enumerate() {
        errors.scoped(format!("[{}].extension", i), |errors| {
            let extension = match plugin.extension {
                Some(extension) => extension,
                None => {
                    errors.add("field not set");
                    return;
                }
            };
            if extension.name.is_empty() {
                errors.add_at("name", "must be non-empty");
                return;
            }
            let config = match extension.typed_config {
                Some(config) => config,
                None => {
                    errors.add_at("typed_config", "field not set");
                    return;
                }
            };
            let plugin_type = proto_type_path(&config.type_url).to_string();
            if plugin_type != ROUTE_LOOKUP_CLUSTER_SPECIFIER_TYPE {
                if plugin.is_optional {
                    set.optional_unsupported.insert(extension.name);
                } else {
                    errors.add_at(
                        "typed_config",
                        format!("unsupported ClusterSpecifierPlugin type '{}'", plugin_type),
                    );
                }
                return;
            }
            set.supported
                .insert(extension.name, ClusterSpecifierPlugin { plugin_type, config });
        });
    }
    set
}

fn validate_virtual_host(
    ctx: &DecodeContext<'_>,
    vhost: ProtoVirtualHost,
    plugins: &PluginSet,
    errors: &mut ValidationErrors,
) -> Option<VirtualHost> {
    if vhost.domains.is_empty() {
        errors.add_at("domains", "must be non-empty");
        return None;
    }
    for (i, domain) in vhost.domains.iter().enumerate() {
        if domain_pattern_type(domain).is_none() {
            errors.add_at(format!("domains[{}]", i), format!("invalid domain pattern \"{}\"", domain));
        }
    }

    let retry_policy = vhost.retry_policy.as_ref().and_then(|policy| {
        errors.scoped("retry_policy", |errors| validate_retry_policy(policy, errors))
    });

    let typed_per_filter_config = errors.scoped("typed_per_filter_config", |errors| {
        validate_per_filter_configs(ctx, vhost.typed_per_filter_config, errors)
    });

    let mut routes = Vec::new();
    errors.scoped("routes", |errors| {
        for (i, route) in vhost.routes.into_iter().enumerate() {
            errors.scoped(format!("[{}]", i), |errors| {
                match validate_route(ctx, route, plugins, errors) {
                    Some(route) => routes.push(route),
                    None => debug!(index = i, "ignoring non-matchable or unsupported route"),
                }
            });
        }
    });
    if routes.is_empty() {
        errors.add_at("routes", "no valid routes in VirtualHost");
        return None;
    }

    Some(VirtualHost { domains: vhost.domains, routes, retry_policy, typed_per_filter_config })
}

/// Returns `None` both for pruned routes (not an error) and for invalid
/// routes (which record errors).
fn validate_route(
    ctx: &DecodeContext<'_>,
    route: ProtoRoute,
    plugins: &PluginSet,
    errors: &mut ValidationErrors,
) -> Option<Route> {
    let matchers = errors.scoped("match", |errors| {
        let route_match = match route.r#match {
            Some(route_match) => route_match,
            None => {
                errors.add("field not present");
                return None;
            }
        };
        validate_route_match(route_match, errors)
    })?;

    let action = errors.scoped("route", |errors| {
        validate_route_action(route.action, plugins, errors)
    })?;

    let typed_per_filter_config = errors.scoped("typed_per_filter_config", |errors| {
        validate_per_filter_configs(ctx, route.typed_per_filter_config, errors)
    });

    Some(Route { matchers, action, typed_per_filter_config })
}

fn validate_route_match(
    route_match: ProtoRouteMatch,
    errors: &mut ValidationErrors,
) -> Option<RouteMatchers> {
    let case_sensitive = route_match.case_sensitive.map(|v| v.value).unwrap_or(true);

    let path_matcher = match route_match.path_specifier {
        Some(route_match::PathSpecifier::Prefix(prefix)) => {
            if !prefix_can_match_path(&prefix) {
                return None;
            }
            StringMatcher::Prefix { value: prefix, case_sensitive }
        }
        Some(route_match::PathSpecifier::Path(path)) => {
            if !exact_path_is_valid(&path) {
                return None;
            }
            StringMatcher::Exact { value: path, case_sensitive }
        }
        Some(route_match::PathSpecifier::SafeRegex(regex)) => {
            match compile_regex(&regex, errors, "safe_regex") {
                Some(regex) => StringMatcher::SafeRegex(regex),
                None => return None,
            }
        }
        Some(_) => {
            // ConnectMatcher and friends cannot match gRPC paths.
            return None;
        }
        None => {
            errors.add("invalid path specifier");
            return None;
        }
    };

    let mut header_matchers = Vec::with_capacity(route_match.headers.len());
    errors.scoped("headers", |errors| {
        for (i, header) in route_match.headers.into_iter().enumerate() {
            errors.scoped(format!("[{}]", i), |errors| {
                if let Some(matcher) = validate_header_matcher(header, errors) {
                    header_matchers.push(matcher);
                }
            });
        }
    });

    let fraction_per_million = route_match.runtime_fraction.as_ref().and_then(|fraction| {
        errors.scoped("runtime_fraction", |errors| {
            validate_runtime_fraction(fraction, errors)
        })
    });

    Some(RouteMatchers { path_matcher, header_matchers, fraction_per_million })
}

/// A prefix can match some `/service/method` path iff it is empty or
/// `/`-anchored with at most two separators and no empty middle segment.
fn prefix_can_match_path(prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    let Some(rest) = prefix.strip_prefix('/') else {
        return false;
    };
    let elements: Vec<&str> = rest.splitn(3, '/').collect();
    match elements.len() {
        1 => true,
        2 => !elements[0].is_empty(),
        _ => false,
    }
}

/// An exact path must be `/service/method` with non-empty segments.
fn exact_path_is_valid(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    let elements: Vec<&str> = rest.split('/').collect();
    elements.len() == 2 && !elements[0].is_empty() && !elements[1].is_empty()
}

fn compile_regex(
    regex: &RegexMatcher,
    errors: &mut ValidationErrors,
    field: &str,
) -> Option<SafeRegex> {
    match SafeRegex::new(&regex.regex) {
        Ok(compiled) => Some(compiled),
        Err(e) => {
            errors.add_at(field, e.to_string());
            None
        }
    }
}

// The legacy match specifiers are deprecated on the wire but still sent by
// older control planes.
#[allow(deprecated)]
fn validate_header_matcher(
    header: ProtoHeaderMatcher,
    errors: &mut ValidationErrors,
) -> Option<HeaderMatcher> {
    let invert = header.invert_match;
    let name = header.name;
    let kind = match header.header_match_specifier {
        Some(HeaderMatchSpecifier::ExactMatch(value)) => {
            HeaderMatcherKind::String(StringMatcher::Exact { value, case_sensitive: true })
        }
        Some(HeaderMatchSpecifier::PrefixMatch(value)) => {
            HeaderMatcherKind::String(StringMatcher::Prefix { value, case_sensitive: true })
        }
        Some(HeaderMatchSpecifier::SuffixMatch(value)) => {
            HeaderMatcherKind::String(StringMatcher::Suffix { value, case_sensitive: true })
        }
        Some(HeaderMatchSpecifier::ContainsMatch(value)) => {
            HeaderMatcherKind::String(StringMatcher::Contains { value, case_sensitive: true })
        }
        Some(HeaderMatchSpecifier::SafeRegexMatch(regex)) => {
            let regex = compile_regex(&regex, errors, "safe_regex_match")?;
            HeaderMatcherKind::String(StringMatcher::SafeRegex(regex))
        }
        Some(HeaderMatchSpecifier::StringMatch(matcher)) => {
            HeaderMatcherKind::String(validate_string_matcher(matcher, errors)?)
        }
        Some(HeaderMatchSpecifier::RangeMatch(range)) => {
            return match HeaderMatcher::range(name, range.start, range.end, invert) {
                Ok(matcher) => Some(matcher),
                Err(e) => {
                    errors.add_at("range_match", e.to_string());
                    None
                }
            };
        }
        Some(HeaderMatchSpecifier::PresentMatch(present)) => HeaderMatcherKind::Present(present),
        None => {
            errors.add("invalid header matcher");
            return None;
        }
    };
    Some(HeaderMatcher { name, kind, invert })
}

fn validate_string_matcher(
    matcher: ProtoStringMatcher,
    errors: &mut ValidationErrors,
) -> Option<StringMatcher> {
    let case_sensitive = !matcher.ignore_case;
    match matcher.match_pattern {
        Some(MatchPattern::Exact(value)) => Some(StringMatcher::Exact { value, case_sensitive }),
        Some(MatchPattern::Prefix(value)) => Some(StringMatcher::Prefix { value, case_sensitive }),
        Some(MatchPattern::Suffix(value)) => Some(StringMatcher::Suffix { value, case_sensitive }),
        Some(MatchPattern::Contains(value)) => {
            Some(StringMatcher::Contains { value, case_sensitive })
        }
        Some(MatchPattern::SafeRegex(regex)) => {
            if matcher.ignore_case {
                errors.add_at("ignore_case", "cannot be used with safe_regex");
                return None;
            }
            Some(StringMatcher::SafeRegex(compile_regex(&regex, errors, "safe_regex")?))
        }
        Some(MatchPattern::Custom(_)) | None => {
            errors.add("invalid string matcher");
            None
        }
    }
}

fn validate_runtime_fraction(
    fraction: &RuntimeFractionalPercent,
    errors: &mut ValidationErrors,
) -> Option<u32> {
    let fraction = fraction.default_value.as_ref()?;
    let multiplier = match DenominatorType::try_from(fraction.denominator) {
        Ok(DenominatorType::Hundred) => 10_000,
        Ok(DenominatorType::TenThousand) => 100,
        Ok(DenominatorType::Million) => 1,
        Err(_) => {
            errors.add_at("default_value.denominator", "unknown denominator type");
            return None;
        }
    };
    Some(fraction.numerator.saturating_mul(multiplier))
}

fn validate_route_action(
    action: Option<route::Action>,
    plugins: &PluginSet,
    errors: &mut ValidationErrors,
) -> Option<RouteActionVariant> {
    let route_action = match action {
        Some(route::Action::Route(route_action)) => route_action,
        Some(route::Action::NonForwardingAction(_)) => {
            return Some(RouteActionVariant::NonForwarding)
        }
        // Redirect, direct-response etc. cannot be used for RPCs; the
        // route is pruned.
        Some(_) | None => return None,
    };

    let kind = match route_action.cluster_specifier {
        Some(route_action::ClusterSpecifier::Cluster(name)) => {
            if name.is_empty() {
                errors.add_at("cluster", "must be non-empty");
                return None;
            }
            RouteActionKind::Cluster(name)
        }
        Some(route_action::ClusterSpecifier::WeightedClusters(weighted)) => {
            errors.scoped("weighted_clusters", |errors| {
                validate_weighted_clusters(weighted, errors)
            })?
        }
        Some(route_action::ClusterSpecifier::ClusterSpecifierPlugin(name)) => {
            if plugins.optional_unsupported.contains(&name) {
                return None;
            }
            if !plugins.supported.contains_key(&name) {
                errors.add_at(
                    "cluster_specifier_plugin",
                    format!("unknown cluster specifier plugin name \"{}\"", name),
                );
                return None;
            }
            RouteActionKind::ClusterSpecifierPlugin(name)
        }
        // Header-based and inline specifiers are not supported; prune.
        Some(_) | None => return None,
    };

    let mut hash_policies = Vec::new();
    errors.scoped("hash_policy", |errors| {
        for (i, policy) in route_action.hash_policy.into_iter().enumerate() {
            errors.scoped(format!("[{}]", i), |errors| {
                if let Some(policy) = validate_hash_policy(policy, errors) {
                    hash_policies.push(policy);
                }
            });
        }
    });

    let retry_policy = route_action.retry_policy.as_ref().and_then(|policy| {
        errors.scoped("retry_policy", |errors| validate_retry_policy(policy, errors))
    });

    let max_stream_duration = route_action.max_stream_duration.as_ref().and_then(|msd| {
        errors.scoped("max_stream_duration", |errors| {
            // grpc_timeout_header_max takes precedence when both are set.
            if let Some(duration) = msd.grpc_timeout_header_max.as_ref() {
                errors.scoped("grpc_timeout_header_max", |errors| {
                    validate_proto_duration(duration, errors)
                })
            } else if let Some(duration) = msd.max_stream_duration.as_ref() {
                errors.scoped("max_stream_duration", |errors| {
                    validate_proto_duration(duration, errors)
                })
            } else {
                None
            }
        })
    });

    Some(RouteActionVariant::Forward(RouteAction {
        kind,
        hash_policies,
        retry_policy,
        max_stream_duration,
    }))
}

// total_weight is deprecated on the wire; when a control plane still sends
// it, it must agree with the computed sum.
#[allow(deprecated)]
fn validate_weighted_clusters(
    weighted: envoy_types::pb::envoy::config::route::v3::WeightedCluster,
    errors: &mut ValidationErrors,
) -> Option<RouteActionKind> {
    if weighted.clusters.is_empty() {
        errors.add_at("clusters", "must be non-empty");
        return None;
    }
    let mut clusters = Vec::new();
    let mut sum: u64 = 0;
    let error_count_before = errors.len();
    for (i, cluster) in weighted.clusters.into_iter().enumerate() {
        errors.scoped(format!("clusters[{}]", i), |errors| {
            let weighted_cluster::ClusterWeight { name, weight, .. } = cluster;
            if name.is_empty() {
                errors.add_at("name", "must be non-empty");
                return;
            }
            let weight = match weight {
                Some(weight) => weight.value,
                None => {
                    errors.add_at("weight", "field is not present");
                    return;
                }
            };
            if weight == 0 {
                return;
            }
            sum += u64::from(weight);
            clusters.push(ClusterWeight { name, weight });
        });
    }
    if errors.len() > error_count_before {
        return None;
    }
    if clusters.is_empty() {
        errors.add_at("clusters", "no valid clusters specified");
        return None;
    }
    if u32::try_from(sum).is_err() {
        errors.add_at("clusters", "sum of cluster weights exceeds uint32 max");
        return None;
    }
    if let Some(total_weight) = weighted.total_weight {
        if u64::from(total_weight.value) != sum {
            errors.add_at(
                "total_weight",
                format!("must equal the sum of cluster weights ({})", sum),
            );
            return None;
        }
    }
    Some(RouteActionKind::WeightedClusters(clusters))
}

fn validate_hash_policy(
    policy: route_action::HashPolicy,
    errors: &mut ValidationErrors,
) -> Option<HashPolicy> {
    use route_action::hash_policy::PolicySpecifier;

    let terminal = policy.terminal;
    match policy.policy_specifier {
        Some(PolicySpecifier::Header(header)) => {
            let (regex, regex_substitution) = match header.regex_rewrite {
                Some(rewrite) => {
                    let pattern = rewrite.pattern.as_ref()?;
                    let regex = compile_regex(pattern, errors, "regex_rewrite.pattern")?;
                    (Some(regex), rewrite.substitution)
                }
                None => (None, String::new()),
            };
            Some(HashPolicy {
                kind: HashPolicyKind::Header {
                    header_name: header.header_name,
                    regex,
                    regex_substitution,
                },
                terminal,
            })
        }
        Some(PolicySpecifier::FilterState(filter_state)) => {
            if filter_state.key == "io.grpc.channel_id" {
                Some(HashPolicy { kind: HashPolicyKind::ChannelId, terminal })
            } else {
                debug!(key = %filter_state.key, "ignoring filter_state hash policy with unknown key");
                None
            }
        }
        _ => {
            debug!("ignoring unsupported hash policy type");
            None
        }
    }
}

fn validate_retry_policy(
    policy: &ProtoRetryPolicy,
    errors: &mut ValidationErrors,
) -> Option<RetryPolicy> {
    let mut retry_on = Vec::new();
    for token in policy.retry_on.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token {
            "cancelled" => retry_on.push(RetryOn::Cancelled),
            "deadline-exceeded" => retry_on.push(RetryOn::DeadlineExceeded),
            "internal" => retry_on.push(RetryOn::Internal),
            "resource-exhausted" => retry_on.push(RetryOn::ResourceExhausted),
            "unavailable" => retry_on.push(RetryOn::Unavailable),
            other => debug!(token = other, "ignoring unknown retry_on token"),
        }
    }

    let num_retries = match &policy.num_retries {
        Some(num) => {
            if num.value == 0 {
                errors.add_at("num_retries", "must be greater than 0");
                return None;
            }
            num.value
        }
        None => 1,
    };

    let retry_back_off = match &policy.retry_back_off {
        Some(back_off) => {
            let base_interval = match &back_off.base_interval {
                Some(duration) => errors.scoped("retry_back_off.base_interval", |errors| {
                    validate_proto_duration(duration, errors)
                })?,
                None => {
                    errors.add_at("retry_back_off.base_interval", "field is not present");
                    return None;
                }
            };
            let max_interval = match &back_off.max_interval {
                Some(duration) => errors.scoped("retry_back_off.max_interval", |errors| {
                    validate_proto_duration(duration, errors)
                })?,
                None => base_interval.saturating_mul(10),
            };
            RetryBackOff { base_interval, max_interval }
        }
        None => RetryBackOff::default(),
    };

    Some(RetryPolicy { retry_on, num_retries, retry_back_off })
}

fn validate_per_filter_configs(
    ctx: &DecodeContext<'_>,
    configs: std::collections::HashMap<String, ProtoAny>,
    errors: &mut ValidationErrors,
) -> BTreeMap<String, FilterConfigOverride> {
    let registry = HttpFilterRegistry::new(&ctx.features);
    let mut validated = BTreeMap::new();
    let mut entries: Vec<_> = configs.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, any) in entries {
        errors.scoped(format!("[{}]", name), |errors| {
            let mut any = any;
            let mut is_optional = false;
            // The override may be wrapped in a FilterConfig carrying the
            // is_optional bit.
            if proto_type_path(&any.type_url) == FILTER_CONFIG_WRAPPER_TYPE {
                match envoy_types::pb::envoy::config::route::v3::FilterConfig::decode(
                    &any.value[..],
                ) {
                    Ok(wrapper) => {
                        is_optional = wrapper.is_optional;
                        match wrapper.config {
                            Some(inner) => any = inner,
                            None => {
                                if !is_optional {
                                    errors.add("no filter config specified");
                                }
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        errors.add(format!("could not parse FilterConfig wrapper: {}", e));
                        return;
                    }
                }
            }
            let filter_type = proto_type_path(&any.type_url).to_string();
            if registry.for_override_type(&filter_type).is_none() {
                if !is_optional {
                    errors.add(format!("unsupported filter type '{}'", filter_type));
                }
                return;
            }
            validated.insert(name, FilterConfigOverride { filter_type, config: any });
        });
    }
    validated
}

/// Select the best-matching virtual host for `authority`: exact beats
/// suffix beats prefix beats the `*` universe pattern, longest pattern
/// winning within a category. Returns an index into `virtual_hosts`.
pub fn find_virtual_host(virtual_hosts: &[VirtualHost], authority: &str) -> Option<usize> {
    let mut best: Option<(DomainMatchType, usize, usize)> = None; // (type, pattern_len, index)
    for (index, vhost) in virtual_hosts.iter().enumerate() {
        for domain in &vhost.domains {
            let Some(match_type) = domain_pattern_type(domain) else {
                continue;
            };
            if !domain_matches(match_type, domain, authority) {
                continue;
            }
            let candidate = (match_type, domain.len(), index);
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    let better = candidate.0 < current.0
                        || (candidate.0 == current.0 && candidate.1 > current.1);
                    if better {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }
    }
    best.map(|(_, _, index)| index)
}
