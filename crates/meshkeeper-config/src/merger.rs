//! Structural config merger
//!
//! Applies a [`DesiredConfiguration`] onto an IstioOperator base manifest.
//! Only present fields are written, so a configuration with every field absent
//! leaves the base document unchanged. The caller's base is never mutated: all
//! work happens on a private copy that is returned only when every step
//! succeeded.

use k8s_openapi::api::core::v1::Affinity;
use serde_json::{json, Map, Value};
use tracing::debug;

use meshkeeper_common::crd::{
    Authorizer, Components, DesiredConfiguration, Experimental, KubernetesResources, MeshConfig,
    Resources,
};
use meshkeeper_common::{Error, Result, INGRESS_GATEWAY_NAME};

use crate::compatibility::CompatibilityTables;
use crate::deep_merge::{
    child_object, deep_merge, first_list_item, list_at, object_at, quantity_value,
    set_if_present, upsert_env,
};

const MESH_CONFIG: &[&str] = &["spec", "meshConfig"];
const GATEWAY_TOPOLOGY: &[&str] = &["spec", "meshConfig", "defaultConfig", "gatewayTopology"];
const PROXY_METADATA: &[&str] = &["spec", "meshConfig", "defaultConfig", "proxyMetadata"];
const PILOT_K8S: &[&str] = &["spec", "components", "pilot", "k8s"];
const CNI_K8S: &[&str] = &["spec", "components", "cni", "k8s"];
const INGRESS_GATEWAYS: &[&str] = &["spec", "components", "ingressGateways"];
const EGRESS_GATEWAYS: &[&str] = &["spec", "components", "egressGateways"];
const PROXY_RESOURCES: &[&str] = &["spec", "values", "global", "proxy", "resources"];

/// Proxy metadata key controlling DNS capture in the sidecar
pub const DNS_CAPTURE_METADATA: &str = "ISTIO_META_DNS_CAPTURE";

const ALPHA_GATEWAY_API_ENV: &str = "PILOT_ENABLE_ALPHA_GATEWAY_API";
const MULTI_NETWORK_GATEWAY_API_ENV: &str = "PILOT_MULTI_NETWORK_DISCOVER_GATEWAY_API";
const DUAL_STACK_ENV: &str = "ISTIO_DUAL_STACK";

/// Applies desired configuration onto base manifests
#[derive(Clone, Debug, Default)]
pub struct StructuralMerger {
    tables: CompatibilityTables,
}

impl StructuralMerger {
    /// Create a merger using the given compatibility tables
    pub fn new(tables: CompatibilityTables) -> Self {
        Self { tables }
    }

    /// Compatibility tables injected into merged manifests
    pub fn tables(&self) -> &CompatibilityTables {
        &self.tables
    }

    /// Merge `desired` onto `base`
    pub fn merge(&self, base: &Value, desired: &DesiredConfiguration) -> Result<Value> {
        self.merge_with_overrides(base, desired, &Value::Null)
    }

    /// Merge `desired` onto `base`, then deep-merge cluster `overrides` on top
    ///
    /// Overrides win over both the base and the desired configuration.
    pub fn merge_with_overrides(
        &self,
        base: &Value,
        desired: &DesiredConfiguration,
        overrides: &Value,
    ) -> Result<Value> {
        if !base.is_object() {
            return Err(Error::manifest_with_context(
                "merge",
                "base manifest must be a mapping",
            ));
        }
        if !overrides.is_null() && !overrides.is_object() {
            return Err(Error::manifest_with_context(
                "merge",
                "cluster overrides must be a mapping",
            ));
        }

        let mut doc = base.clone();

        merge_mesh_config(&mut doc, &desired.config)?;
        append_authorizers(&mut doc, &desired.config.authorizers)?;
        if let Some(policy) = desired.config.gateway_external_traffic_policy.as_deref() {
            append_traffic_policy_overlay(&mut doc, policy)?;
        }
        if let Some(components) = &desired.components {
            merge_components(&mut doc, components)?;
        }
        if let Some(experimental) = &desired.experimental {
            merge_experimental(&mut doc, experimental)?;
        }
        if desired.is_compatibility_mode() {
            self.apply_compatibility(&mut doc)?;
        }

        deep_merge(&mut doc, overrides);

        debug!(
            authorizers = desired.config.authorizers.len(),
            compatibility_mode = desired.is_compatibility_mode(),
            "merged desired configuration into manifest"
        );
        Ok(doc)
    }

    fn apply_compatibility(&self, doc: &mut Value) -> Result<()> {
        if !self.tables.pilot_env.is_empty() {
            let env = list_at(object_at(doc, PILOT_K8S)?, "env")?;
            for (name, value) in &self.tables.pilot_env {
                upsert_env(env, name, value);
            }
        }
        if !self.tables.proxy_metadata.is_empty() {
            let metadata = object_at(doc, PROXY_METADATA)?;
            for (key, value) in &self.tables.proxy_metadata {
                metadata.insert(key.clone(), Value::String(value.clone()));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Mesh configuration
// =============================================================================

fn merge_mesh_config(doc: &mut Value, config: &MeshConfig) -> Result<()> {
    if let Some(count) = config.num_trusted_proxies {
        object_at(doc, GATEWAY_TOPOLOGY)?.insert("numTrustedProxies".into(), count.into());
    }
    if let Some(xfcc) = config.forward_client_cert_details {
        object_at(doc, GATEWAY_TOPOLOGY)?
            .insert("forwardClientCertDetails".into(), xfcc.as_str().into());
    }
    if let Some(trust_domain) = &config.trust_domain {
        object_at(doc, MESH_CONFIG)?.insert("trustDomain".into(), trust_domain.as_str().into());
    }
    if let Some(enabled) = config.enable_dns_proxying {
        object_at(doc, PROXY_METADATA)?
            .insert(DNS_CAPTURE_METADATA.into(), enabled.to_string().into());
    }
    let prometheus_merge = config
        .telemetry
        .as_ref()
        .and_then(|t| t.metrics.as_ref())
        .and_then(|m| m.prometheus_merge);
    if let Some(enabled) = prometheus_merge {
        object_at(doc, MESH_CONFIG)?.insert("enablePrometheusMerge".into(), enabled.into());
    }
    Ok(())
}

/// Append authorizers as extension providers, in order and without deduplication
fn append_authorizers(doc: &mut Value, authorizers: &[Authorizer]) -> Result<()> {
    if authorizers.is_empty() {
        return Ok(());
    }
    let providers = list_at(object_at(doc, MESH_CONFIG)?, "extensionProviders")?;
    providers.extend(authorizers.iter().map(extension_provider));
    Ok(())
}

fn extension_provider(authorizer: &Authorizer) -> Value {
    let mut http = Map::new();
    http.insert("service".into(), authorizer.service.as_str().into());
    http.insert("port".into(), authorizer.port.into());
    set_if_present(&mut http, "pathPrefix", authorizer.path_prefix.as_ref());
    set_if_present(&mut http, "timeout", authorizer.timeout.as_ref());

    if let Some(headers) = &authorizer.headers {
        if let Some(in_check) = &headers.in_check {
            if let Some(include) = &in_check.include {
                http.insert("includeRequestHeadersInCheck".into(), json!(include));
            }
            if let Some(add) = &in_check.add {
                http.insert("includeAdditionalHeadersInCheck".into(), json!(add));
            }
        }
        if let Some(on_allow) = headers.to_upstream.as_ref().and_then(|u| u.on_allow.as_ref()) {
            http.insert("headersToUpstreamOnAllow".into(), json!(on_allow));
        }
        if let Some(downstream) = &headers.to_downstream {
            if let Some(on_allow) = &downstream.on_allow {
                http.insert("headersToDownstreamOnAllow".into(), json!(on_allow));
            }
            if let Some(on_deny) = &downstream.on_deny {
                http.insert("headersToDownstreamOnDeny".into(), json!(on_deny));
            }
        }
    }

    json!({
        "name": authorizer.name,
        "envoyExtAuthzHttp": Value::Object(http),
    })
}

/// Append an overlay patching the ingress gateway Service's traffic policy
///
/// Always appends. Calling this twice in one merge yields two overlays.
fn append_traffic_policy_overlay(doc: &mut Value, policy: &str) -> Result<()> {
    let gateway = first_list_item(doc, INGRESS_GATEWAYS)?;
    let k8s = child_object(gateway, "k8s")?;

    list_at(k8s, "overlays")?.push(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "name": INGRESS_GATEWAY_NAME,
        "patches": [{
            "path": "spec.externalTrafficPolicy",
            "value": policy,
        }],
    }));

    // Local traffic policy drops traffic on nodes without a gateway pod, so spread them
    let affinity = if policy == "Local" {
        json!({
            "podAntiAffinity": {
                "preferredDuringSchedulingIgnoredDuringExecution": [{
                    "weight": 100,
                    "podAffinityTerm": {
                        "topologyKey": "kubernetes.io/hostname",
                        "labelSelector": {
                            "matchLabels": { "app": INGRESS_GATEWAY_NAME }
                        }
                    }
                }]
            }
        })
    } else {
        json!({})
    };
    k8s.insert("affinity".into(), affinity);
    Ok(())
}

// =============================================================================
// Components
// =============================================================================

fn merge_components(doc: &mut Value, components: &Components) -> Result<()> {
    if let Some(k8s) = components.pilot.as_ref().and_then(|p| p.k8s.as_ref()) {
        merge_kubernetes_resources(object_at(doc, PILOT_K8S)?, k8s)?;
    }

    if let Some(k8s) = components
        .ingress_gateway
        .as_ref()
        .and_then(|g| g.k8s.as_ref())
    {
        let gateway = first_list_item(doc, INGRESS_GATEWAYS)?;
        merge_kubernetes_resources(child_object(gateway, "k8s")?, k8s)?;
    }

    if let Some(egress) = &components.egress_gateway {
        if egress.enabled.is_some() || egress.k8s.is_some() {
            let gateway = first_list_item(doc, EGRESS_GATEWAYS)?;
            set_if_present(gateway, "enabled", egress.enabled.as_ref());
            if let Some(k8s) = &egress.k8s {
                merge_kubernetes_resources(child_object(gateway, "k8s")?, k8s)?;
            }
        }
    }

    if let Some(k8s) = components.cni.as_ref().and_then(|c| c.k8s.as_ref()) {
        if k8s.affinity.is_some() || k8s.resources.is_some() {
            let cni = object_at(doc, CNI_K8S)?;
            if let Some(affinity) = &k8s.affinity {
                merge_affinity(child_object(cni, "affinity")?, affinity)?;
            }
            if let Some(resources) = &k8s.resources {
                merge_resources(child_object(cni, "resources")?, resources)?;
            }
        }
    }

    if let Some(resources) = components
        .proxy
        .as_ref()
        .and_then(|p| p.k8s.as_ref())
        .and_then(|k| k.resources.as_ref())
    {
        merge_resources(object_at(doc, PROXY_RESOURCES)?, resources)?;
    }

    Ok(())
}

fn merge_kubernetes_resources(
    target: &mut Map<String, Value>,
    k8s: &KubernetesResources,
) -> Result<()> {
    if let Some(resources) = &k8s.resources {
        merge_resources(child_object(target, "resources")?, resources)?;
    }

    if let Some(hpa) = &k8s.hpa_spec {
        let hpa_target = child_object(target, "hpaSpec")?;
        set_if_present(hpa_target, "maxReplicas", hpa.max_replicas.as_ref());
        set_if_present(hpa_target, "minReplicas", hpa.min_replicas.as_ref());
    }

    if let Some(rolling) = k8s.strategy.as_ref().and_then(|s| s.rolling_update.as_ref()) {
        let rolling_target = child_object(child_object(target, "strategy")?, "rollingUpdate")?;
        if let Some(surge) = &rolling.max_surge {
            rolling_target.insert("maxSurge".into(), serde_json::to_value(surge)?);
        }
        if let Some(unavailable) = &rolling.max_unavailable {
            rolling_target.insert("maxUnavailable".into(), serde_json::to_value(unavailable)?);
        }
    }

    Ok(())
}

/// Field-by-field merge of CPU and memory claims, validating every quantity
fn merge_resources(target: &mut Map<String, Value>, resources: &Resources) -> Result<()> {
    for (kind, claims) in [("limits", &resources.limits), ("requests", &resources.requests)] {
        let Some(claims) = claims else { continue };
        let claims_target = child_object(target, kind)?;
        if let Some(cpu) = &claims.cpu {
            claims_target.insert("cpu".into(), quantity_value(cpu)?);
        }
        if let Some(memory) = &claims.memory {
            claims_target.insert("memory".into(), quantity_value(memory)?);
        }
    }
    Ok(())
}

/// Replace each affinity kind that the user specified
fn merge_affinity(target: &mut Map<String, Value>, affinity: &Affinity) -> Result<()> {
    if let Some(pod_affinity) = &affinity.pod_affinity {
        target.insert("podAffinity".into(), serde_json::to_value(pod_affinity)?);
    }
    if let Some(pod_anti_affinity) = &affinity.pod_anti_affinity {
        target.insert("podAntiAffinity".into(), serde_json::to_value(pod_anti_affinity)?);
    }
    if let Some(node_affinity) = &affinity.node_affinity {
        target.insert("nodeAffinity".into(), serde_json::to_value(node_affinity)?);
    }
    Ok(())
}

// =============================================================================
// Experimental
// =============================================================================

fn merge_experimental(doc: &mut Value, experimental: &Experimental) -> Result<()> {
    let pilot = experimental.pilot.as_ref();
    let mut pilot_env = Vec::new();
    if pilot.and_then(|p| p.enable_alpha_gateway_api) == Some(true) {
        pilot_env.push(ALPHA_GATEWAY_API_ENV);
    }
    if pilot.and_then(|p| p.enable_multi_network_discover_gateway_api) == Some(true) {
        pilot_env.push(MULTI_NETWORK_GATEWAY_API_ENV);
    }
    let dual_stack = experimental.enable_dual_stack == Some(true);
    if dual_stack {
        pilot_env.push(DUAL_STACK_ENV);
    }

    if !pilot_env.is_empty() {
        let env = list_at(object_at(doc, PILOT_K8S)?, "env")?;
        for name in pilot_env {
            upsert_env(env, name, "true");
        }
    }
    if dual_stack {
        object_at(doc, PROXY_METADATA)?.insert(DUAL_STACK_ENV.into(), "true".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    };
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use meshkeeper_common::crd::{
        AuthorizerHeaders, CniComponent, CniKubernetesResources, DownstreamHeaders,
        EgressGateway, ExperimentalPilot, HpaSpec, InCheckHeaders, IstioComponent, Metrics,
        ProxyComponent, ProxyKubernetesResources, ResourceClaims, RollingUpdate, Strategy,
        Telemetry, UpstreamHeaders, XfccStrategy,
    };
    use meshkeeper_common::yaml::parse_manifest;

    const BASE: &str = r#"
apiVersion: install.istio.io/v1alpha1
kind: IstioOperator
metadata:
  name: default
  namespace: istio-system
spec:
  meshConfig:
    enablePrometheusMerge: false
    trustDomain: cluster.local
    defaultConfig:
      holdApplicationUntilProxyStarts: true
      gatewayTopology:
        numTrustedProxies: 1
  components:
    pilot:
      k8s:
        env:
          - name: ENABLE_AUTO_SNI
            value: "true"
        resources:
          requests:
            cpu: 50m
            memory: 128Mi
    ingressGateways:
      - name: istio-ingressgateway
        enabled: true
        k8s:
          hpaSpec:
            minReplicas: 1
            maxReplicas: 5
          resources:
            limits:
              cpu: "2"
              memory: 1Gi
  values:
    global:
      proxy:
        resources:
          requests:
            cpu: 10m
            memory: 32Mi
"#;

    fn base() -> Value {
        parse_manifest(BASE).unwrap()
    }

    fn merger() -> StructuralMerger {
        StructuralMerger::default()
    }

    fn claims(cpu: Option<&str>, memory: Option<&str>) -> Option<ResourceClaims> {
        Some(ResourceClaims {
            cpu: cpu.map(String::from),
            memory: memory.map(String::from),
        })
    }

    // ==========================================================================
    // Idempotence and override semantics
    // ==========================================================================

    #[test]
    fn absent_configuration_leaves_base_unchanged() {
        let base = base();
        let merged = merger()
            .merge_with_overrides(&base, &DesiredConfiguration::default(), &json!({}))
            .unwrap();
        assert_eq!(merged, base);
    }

    #[test]
    fn present_empty_sections_leave_base_unchanged() {
        let base = base();
        let desired = DesiredConfiguration {
            components: Some(Components {
                pilot: Some(IstioComponent { k8s: None }),
                egress_gateway: Some(EgressGateway::default()),
                cni: Some(CniComponent { k8s: None }),
                ..Default::default()
            }),
            experimental: Some(Experimental::default()),
            compatibility_mode: Some(false),
            ..Default::default()
        };
        assert_eq!(merger().merge(&base, &desired).unwrap(), base);
    }

    #[test]
    fn present_values_override_base() {
        let desired = DesiredConfiguration {
            config: MeshConfig {
                num_trusted_proxies: Some(3),
                trust_domain: Some("example.org".into()),
                telemetry: Some(Telemetry {
                    metrics: Some(Metrics {
                        prometheus_merge: Some(true),
                    }),
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = merger().merge(&base(), &desired).unwrap();
        let mesh = &merged["spec"]["meshConfig"];
        assert_eq!(mesh["defaultConfig"]["gatewayTopology"]["numTrustedProxies"], 3);
        assert_eq!(mesh["trustDomain"], "example.org");
        assert_eq!(mesh["enablePrometheusMerge"], true);
        assert_eq!(mesh["defaultConfig"]["holdApplicationUntilProxyStarts"], true);
    }

    #[test]
    fn zero_value_is_written_not_skipped() {
        let desired = DesiredConfiguration {
            config: MeshConfig {
                num_trusted_proxies: Some(0),
                enable_dns_proxying: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = merger().merge(&base(), &desired).unwrap();
        assert_eq!(
            merged["spec"]["meshConfig"]["defaultConfig"]["gatewayTopology"]["numTrustedProxies"],
            0
        );
        assert_eq!(
            merged["spec"]["meshConfig"]["defaultConfig"]["proxyMetadata"][DNS_CAPTURE_METADATA],
            "false"
        );
    }

    #[test]
    fn caller_base_is_not_mutated() {
        let base = base();
        let snapshot = base.clone();
        let desired = DesiredConfiguration {
            config: MeshConfig {
                num_trusted_proxies: Some(9),
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = merger().merge(&base, &desired).unwrap();
        assert_ne!(merged, base);
        assert_eq!(base, snapshot);
    }

    #[test]
    fn xfcc_and_dns_paths() {
        let desired = DesiredConfiguration {
            config: MeshConfig {
                forward_client_cert_details: Some(XfccStrategy::SanitizeSet),
                enable_dns_proxying: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = merger().merge(&base(), &desired).unwrap();
        let default_config = &merged["spec"]["meshConfig"]["defaultConfig"];
        assert_eq!(
            default_config["gatewayTopology"]["forwardClientCertDetails"],
            "SANITIZE_SET"
        );
        assert_eq!(default_config["gatewayTopology"]["numTrustedProxies"], 1);
        assert_eq!(default_config["proxyMetadata"][DNS_CAPTURE_METADATA], "true");
    }

    // ==========================================================================
    // Authorizers
    // ==========================================================================

    #[test]
    fn authorizers_are_appended_with_headers() {
        let desired = DesiredConfiguration {
            config: MeshConfig {
                authorizers: vec![
                    Authorizer {
                        name: "oauth2".into(),
                        service: "oauth2-proxy.auth.svc.cluster.local".into(),
                        port: 4180,
                        headers: Some(AuthorizerHeaders {
                            in_check: Some(InCheckHeaders {
                                include: Some(vec!["authorization".into()]),
                                add: Some([("x-ext".to_string(), "1".to_string())].into()),
                            }),
                            to_upstream: Some(UpstreamHeaders {
                                on_allow: Some(vec!["x-user".into()]),
                            }),
                            to_downstream: Some(DownstreamHeaders {
                                on_allow: None,
                                on_deny: Some(vec!["set-cookie".into()]),
                            }),
                        }),
                        path_prefix: None,
                        timeout: Some("5s".into()),
                    },
                    Authorizer {
                        name: "oauth2".into(),
                        service: "other.svc".into(),
                        port: 80,
                        headers: None,
                        path_prefix: Some("/check".into()),
                        timeout: None,
                    },
                ],
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = merger().merge(&base(), &desired).unwrap();
        let providers = merged["spec"]["meshConfig"]["extensionProviders"]
            .as_array()
            .unwrap();
        assert_eq!(providers.len(), 2, "duplicate names are not deduplicated");

        let first = &providers[0]["envoyExtAuthzHttp"];
        assert_eq!(providers[0]["name"], "oauth2");
        assert_eq!(first["service"], "oauth2-proxy.auth.svc.cluster.local");
        assert_eq!(first["port"], 4180);
        assert_eq!(first["timeout"], "5s");
        assert_eq!(first["includeRequestHeadersInCheck"], json!(["authorization"]));
        assert_eq!(first["includeAdditionalHeadersInCheck"], json!({"x-ext": "1"}));
        assert_eq!(first["headersToUpstreamOnAllow"], json!(["x-user"]));
        assert_eq!(first["headersToDownstreamOnDeny"], json!(["set-cookie"]));
        assert!(first.get("headersToDownstreamOnAllow").is_none());

        let second = &providers[1]["envoyExtAuthzHttp"];
        assert_eq!(second["pathPrefix"], "/check");
        assert!(second.get("includeRequestHeadersInCheck").is_none());
    }

    #[test]
    fn authorizers_extend_existing_providers() {
        let mut base = base();
        base["spec"]["meshConfig"]["extensionProviders"] = json!([{"name": "existing"}]);
        let desired = DesiredConfiguration {
            config: MeshConfig {
                authorizers: vec![Authorizer {
                    name: "new".into(),
                    service: "svc".into(),
                    port: 1,
                    headers: None,
                    path_prefix: None,
                    timeout: None,
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = merger().merge(&base, &desired).unwrap();
        let providers = merged["spec"]["meshConfig"]["extensionProviders"]
            .as_array()
            .unwrap();
        assert_eq!(providers[0]["name"], "existing");
        assert_eq!(providers[1]["name"], "new");
    }

    // ==========================================================================
    // External traffic policy overlay
    // ==========================================================================

    fn with_policy(policy: &str) -> DesiredConfiguration {
        DesiredConfiguration {
            config: MeshConfig {
                gateway_external_traffic_policy: Some(policy.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn local_policy_adds_overlay_and_anti_affinity() {
        let merged = merger().merge(&base(), &with_policy("Local")).unwrap();
        let k8s = &merged["spec"]["components"]["ingressGateways"][0]["k8s"];
        assert_eq!(
            k8s["overlays"],
            json!([{
                "apiVersion": "v1",
                "kind": "Service",
                "name": "istio-ingressgateway",
                "patches": [{"path": "spec.externalTrafficPolicy", "value": "Local"}]
            }])
        );
        let term = &k8s["affinity"]["podAntiAffinity"]
            ["preferredDuringSchedulingIgnoredDuringExecution"][0];
        assert_eq!(term["weight"], 100);
        assert_eq!(term["podAffinityTerm"]["topologyKey"], "kubernetes.io/hostname");
        assert_eq!(k8s["hpaSpec"]["maxReplicas"], 5);
    }

    #[test]
    fn cluster_policy_clears_affinity() {
        let mut base = base();
        base["spec"]["components"]["ingressGateways"][0]["k8s"]["affinity"] =
            json!({"podAntiAffinity": {}});
        let merged = merger().merge(&base, &with_policy("Cluster")).unwrap();
        let k8s = &merged["spec"]["components"]["ingressGateways"][0]["k8s"];
        assert_eq!(k8s["affinity"], json!({}));
        assert_eq!(k8s["overlays"][0]["patches"][0]["value"], "Cluster");
    }

    #[test]
    fn overlay_is_append_only() {
        let mut base = base();
        base["spec"]["components"]["ingressGateways"][0]["k8s"]["overlays"] = json!([{
            "kind": "Service",
            "name": "istio-ingressgateway",
            "patches": [{"path": "spec.externalTrafficPolicy", "value": "Cluster"}]
        }]);
        let merged = merger().merge(&base, &with_policy("Local")).unwrap();
        let overlays = merged["spec"]["components"]["ingressGateways"][0]["k8s"]["overlays"]
            .as_array()
            .unwrap();
        assert_eq!(overlays.len(), 2);
        assert_eq!(overlays[1]["patches"][0]["value"], "Local");
    }

    #[test]
    fn overlay_creates_missing_gateway() {
        let base = json!({"spec": {}});
        let merged = merger().merge(&base, &with_policy("Local")).unwrap();
        assert!(merged["spec"]["components"]["ingressGateways"][0]["k8s"]["overlays"].is_array());
    }

    // ==========================================================================
    // Component resources
    // ==========================================================================

    #[test]
    fn component_resources_merge_field_by_field() {
        let desired = DesiredConfiguration {
            components: Some(Components {
                pilot: Some(IstioComponent {
                    k8s: Some(KubernetesResources {
                        resources: Some(Resources {
                            limits: claims(Some("1"), None),
                            requests: claims(Some("100m"), None),
                        }),
                        ..Default::default()
                    }),
                }),
                ingress_gateway: Some(IstioComponent {
                    k8s: Some(KubernetesResources {
                        hpa_spec: Some(HpaSpec {
                            max_replicas: Some(10),
                            min_replicas: None,
                        }),
                        strategy: Some(Strategy {
                            rolling_update: Some(RollingUpdate {
                                max_surge: Some(IntOrString::String("25%".into())),
                                max_unavailable: Some(IntOrString::Int(0)),
                            }),
                        }),
                        resources: Some(Resources {
                            limits: claims(None, Some("2Gi")),
                            requests: None,
                        }),
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merger().merge(&base(), &desired).unwrap();

        let pilot = &merged["spec"]["components"]["pilot"]["k8s"];
        assert_eq!(pilot["resources"]["requests"]["cpu"], "100m");
        assert_eq!(pilot["resources"]["requests"]["memory"], "128Mi");
        assert_eq!(pilot["resources"]["limits"]["cpu"], "1");

        let gateway = &merged["spec"]["components"]["ingressGateways"][0]["k8s"];
        assert_eq!(gateway["hpaSpec"]["maxReplicas"], 10);
        assert_eq!(gateway["hpaSpec"]["minReplicas"], 1);
        assert_eq!(gateway["strategy"]["rollingUpdate"]["maxSurge"], "25%");
        assert_eq!(gateway["strategy"]["rollingUpdate"]["maxUnavailable"], 0);
        assert_eq!(gateway["resources"]["limits"]["memory"], "2Gi");
        assert_eq!(gateway["resources"]["limits"]["cpu"], "2");
    }

    #[test]
    fn invalid_quantity_fails_whole_merge() {
        let desired = DesiredConfiguration {
            components: Some(Components {
                pilot: Some(IstioComponent {
                    k8s: Some(KubernetesResources {
                        resources: Some(Resources {
                            limits: claims(Some("fast"), None),
                            requests: None,
                        }),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let base = base();
        let err = merger().merge(&base, &desired).unwrap_err();
        assert!(matches!(err, Error::Quantity { .. }));
        assert_eq!(base, parse_manifest(BASE).unwrap());
    }

    #[test]
    fn proxy_resources_go_to_global_values() {
        let desired = DesiredConfiguration {
            components: Some(Components {
                proxy: Some(ProxyComponent {
                    k8s: Some(ProxyKubernetesResources {
                        resources: Some(Resources {
                            limits: claims(Some("500m"), Some("256Mi")),
                            requests: claims(Some("20m"), None),
                        }),
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merger().merge(&base(), &desired).unwrap();
        let resources = &merged["spec"]["values"]["global"]["proxy"]["resources"];
        assert_eq!(resources["limits"], json!({"cpu": "500m", "memory": "256Mi"}));
        assert_eq!(resources["requests"], json!({"cpu": "20m", "memory": "32Mi"}));
    }

    #[test]
    fn egress_gateway_enabled_and_resources() {
        let desired = DesiredConfiguration {
            components: Some(Components {
                egress_gateway: Some(EgressGateway {
                    enabled: Some(true),
                    k8s: Some(KubernetesResources {
                        resources: Some(Resources {
                            limits: None,
                            requests: claims(Some("10m"), None),
                        }),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merger().merge(&base(), &desired).unwrap();
        let egress = &merged["spec"]["components"]["egressGateways"][0];
        assert_eq!(egress["enabled"], true);
        assert_eq!(egress["k8s"]["resources"]["requests"]["cpu"], "10m");
    }

    #[test]
    fn cni_affinity_and_resources() {
        let node_affinity = NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: "kubernetes.io/os".into(),
                        operator: "In".into(),
                        values: Some(vec!["linux".into()]),
                    }]),
                    match_fields: None,
                }],
            }),
            preferred_during_scheduling_ignored_during_execution: None,
        };
        let desired = DesiredConfiguration {
            components: Some(Components {
                cni: Some(CniComponent {
                    k8s: Some(CniKubernetesResources {
                        affinity: Some(Affinity {
                            node_affinity: Some(node_affinity),
                            ..Default::default()
                        }),
                        resources: Some(Resources {
                            limits: claims(None, Some("512Mi")),
                            requests: None,
                        }),
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merger().merge(&base(), &desired).unwrap();
        let cni = &merged["spec"]["components"]["cni"]["k8s"];
        assert_eq!(
            cni["affinity"]["nodeAffinity"]["requiredDuringSchedulingIgnoredDuringExecution"]
                ["nodeSelectorTerms"][0]["matchExpressions"][0]["key"],
            "kubernetes.io/os"
        );
        assert!(cni["affinity"].get("podAffinity").is_none());
        assert_eq!(cni["resources"]["limits"]["memory"], "512Mi");
    }

    // ==========================================================================
    // Compatibility mode and experimental features
    // ==========================================================================

    #[test]
    fn compatibility_mode_overwrites_env_without_duplicates() {
        let desired = DesiredConfiguration {
            compatibility_mode: Some(true),
            ..Default::default()
        };
        let merged = merger().merge(&base(), &desired).unwrap();
        let env = merged["spec"]["components"]["pilot"]["k8s"]["env"]
            .as_array()
            .unwrap();
        let auto_sni: Vec<_> = env
            .iter()
            .filter(|e| e["name"] == "ENABLE_AUTO_SNI")
            .collect();
        assert_eq!(auto_sni.len(), 1);
        assert_eq!(auto_sni[0]["value"], "false");
        assert_eq!(env.len(), 3);

        let metadata = &merged["spec"]["meshConfig"]["defaultConfig"]["proxyMetadata"];
        assert_eq!(metadata["ENABLE_DEFERRED_CLUSTER_CREATION"], "false");
    }

    #[test]
    fn injected_tables_are_used() {
        let tables = CompatibilityTables {
            pilot_env: [("CUSTOM".to_string(), "1".to_string())].into(),
            proxy_metadata: Default::default(),
        };
        let desired = DesiredConfiguration {
            compatibility_mode: Some(true),
            ..Default::default()
        };
        let merged = StructuralMerger::new(tables).merge(&base(), &desired).unwrap();
        let env = &merged["spec"]["components"]["pilot"]["k8s"]["env"];
        assert_eq!(env.as_array().unwrap().len(), 2);
        assert!(merged["spec"]["meshConfig"]["defaultConfig"]
            .get("proxyMetadata")
            .is_none());
    }

    #[test]
    fn experimental_pilot_features() {
        let desired = DesiredConfiguration {
            experimental: Some(Experimental {
                pilot: Some(ExperimentalPilot {
                    enable_alpha_gateway_api: Some(true),
                    enable_multi_network_discover_gateway_api: Some(false),
                }),
                enable_dual_stack: Some(true),
            }),
            ..Default::default()
        };
        let merged = merger().merge(&base(), &desired).unwrap();
        let env = merged["spec"]["components"]["pilot"]["k8s"]["env"]
            .as_array()
            .unwrap();
        let names: Vec<_> = env.iter().map(|e| e["name"].as_str().unwrap()).collect();
        assert!(names.contains(&ALPHA_GATEWAY_API_ENV));
        assert!(names.contains(&DUAL_STACK_ENV));
        assert!(!names.contains(&MULTI_NETWORK_GATEWAY_API_ENV));
        assert_eq!(
            merged["spec"]["meshConfig"]["defaultConfig"]["proxyMetadata"][DUAL_STACK_ENV],
            "true"
        );
    }

    // ==========================================================================
    // Cluster overrides and failure modes
    // ==========================================================================

    #[test]
    fn cluster_overrides_win_last() {
        let desired = DesiredConfiguration {
            config: MeshConfig {
                trust_domain: Some("from-user".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let overrides = json!({
            "spec": {
                "meshConfig": {"trustDomain": "from-cluster"},
                "values": {"cni": {"cniBinDir": "/home/kubernetes/bin"}}
            }
        });
        let merged = merger()
            .merge_with_overrides(&base(), &desired, &overrides)
            .unwrap();
        assert_eq!(merged["spec"]["meshConfig"]["trustDomain"], "from-cluster");
        assert_eq!(merged["spec"]["values"]["cni"]["cniBinDir"], "/home/kubernetes/bin");
        assert_eq!(
            merged["spec"]["values"]["global"]["proxy"]["resources"]["requests"]["cpu"],
            "10m"
        );
    }

    #[test]
    fn non_mapping_inputs_are_rejected() {
        let desired = DesiredConfiguration::default();
        assert!(merger().merge(&json!("text"), &desired).is_err());
        assert!(merger()
            .merge_with_overrides(&base(), &desired, &json!([1]))
            .is_err());
    }

    #[test]
    fn unexpected_structure_is_an_error() {
        let base = json!({"spec": {"meshConfig": {"defaultConfig": "oops"}}});
        let desired = DesiredConfiguration {
            config: MeshConfig {
                num_trusted_proxies: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = merger().merge(&base, &desired).unwrap_err();
        assert!(matches!(err, Error::Manifest { .. }));
    }
}
