//! Tunnel agent injection.
//!
//! Validates a Compose document against the tunnel agent contract and
//! rewrites it so the agent service exists, is correctly configured and
//! shares a network with every other service. Running [`TunnelInjector::inject`]
//! on its own output changes nothing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compose::document::{
    ComposeDocument, HealthCheck, MountSpec, NetworkSpec, ServiceNetworks, ServiceSpec,
};
use crate::errors::DockyardError;
use crate::models::deployment::TunnelConfig;
use crate::storage::settings::TunnelSettings;

/// Environment variable carrying the tunnel control-plane endpoint
pub const ENDPOINT_ENV: &str = "PANGOLIN_ENDPOINT";
/// Environment variable carrying the agent identity
pub const AGENT_ID_ENV: &str = "NEWT_ID";
/// Environment variable carrying the agent secret
pub const AGENT_SECRET_ENV: &str = "NEWT_SECRET";

/// Variables the agent refuses to start without
pub const REQUIRED_ENV: [&str; 3] = [ENDPOINT_ENV, AGENT_ID_ENV, AGENT_SECRET_ENV];

/// Substring identifying the agent image
const AGENT_IMAGE_MARKER: &str = "newt";

/// Static part of the synthesized agent service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectorConfig {
    pub service_name: String,
    pub image: String,
    pub default_network: String,
    pub docker_socket: String,
    pub agent_log_level: String,
    pub health_file: String,
    pub restart_policy: String,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self::from(&TunnelSettings::default())
    }
}

impl From<&TunnelSettings> for InjectorConfig {
    fn from(settings: &TunnelSettings) -> Self {
        Self {
            service_name: settings.service_name.clone(),
            image: settings.image.clone(),
            default_network: settings.default_network.clone(),
            docker_socket: settings.docker_socket.clone(),
            agent_log_level: settings.log_level.clone(),
            health_file: settings.health_file.clone(),
            restart_policy: "unless-stopped".to_string(),
        }
    }
}

/// Outcome of validating a document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// No issues were found
    pub valid: bool,
    pub has_tunnel_agent: bool,
    pub network_ok: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    /// Changes made by an injection pass
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied: Vec<String>,
}

/// What an injection pass would change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub has_tunnel_agent: bool,
    pub add_tunnel_agent: bool,
    pub replace_tunnel_agent: bool,
    pub add_default_network: bool,
    /// Services that would join the default network
    pub add_network_membership: Vec<String>,
    /// Human readable list of the changes above
    pub changes: Vec<String>,
    /// Agent service that would be written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_service: Option<ServiceSpec>,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Injects the tunnel agent sidecar into Compose documents
#[derive(Debug, Clone)]
pub struct TunnelInjector {
    config: InjectorConfig,
    credentials: TunnelConfig,
}

impl TunnelInjector {
    pub fn new(config: InjectorConfig, credentials: TunnelConfig) -> Self {
        Self {
            config,
            credentials,
        }
    }

    pub fn config(&self) -> &InjectorConfig {
        &self.config
    }

    /// Check a document without modifying it
    pub fn validate(&self, doc: &ComposeDocument) -> ValidationReport {
        let mut report = ValidationReport {
            valid: true,
            network_ok: true,
            ..Default::default()
        };

        if doc.services.is_empty() {
            report
                .issues
                .push("No services defined in docker-compose file".to_string());
            report.valid = false;
            return report;
        }

        if let Some(agent) = doc.services.get(&self.config.service_name) {
            report.has_tunnel_agent = true;
            report.issues.extend(self.agent_issues(agent));
        }

        self.check_networks(doc, &mut report);
        check_port_collisions(doc, &mut report);

        if !report.has_tunnel_agent {
            report.suggestions.push(format!(
                "Add {} service for remote tunnel access",
                self.config.service_name
            ));
        }
        if doc.networks.is_empty() {
            report
                .suggestions
                .push("Define custom networks for better service isolation".to_string());
        }

        report.valid = report.issues.is_empty();
        report
    }

    /// Report what [`Self::inject`] would change
    pub fn preview(&self, doc: &ComposeDocument) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        if doc.services.is_empty() {
            return summary;
        }

        let name = &self.config.service_name;
        match doc.services.get(name) {
            None => {
                summary.add_tunnel_agent = true;
                summary.changes.push(format!("Add {} service", name));
            }
            Some(agent) => {
                summary.has_tunnel_agent = true;
                let issues = self.agent_issues(agent);
                if !issues.is_empty() {
                    summary.replace_tunnel_agent = true;
                    summary.changes.push(format!(
                        "Replace misconfigured {} service ({})",
                        name,
                        issues.join("; ")
                    ));
                }
            }
        }
        if summary.add_tunnel_agent || summary.replace_tunnel_agent {
            summary.tunnel_service = Some(self.agent_service());
        }

        let network = &self.config.default_network;
        if !doc.networks.contains_key(network) {
            summary.add_default_network = true;
            summary.changes.push(format!("Add network {}", network));
        }

        for (service_name, service) in &doc.services {
            if service_name == name && summary.tunnel_service.is_some() {
                continue;
            }
            if joins_networks(service) && !service.has_network(network) {
                summary.add_network_membership.push(service_name.clone());
                summary.changes.push(format!(
                    "Add {} membership to service {}",
                    network, service_name
                ));
            }
        }

        summary
    }

    /// Apply the injection and validate the result
    pub fn inject(&self, mut doc: ComposeDocument) -> (ComposeDocument, ValidationReport) {
        let plan = self.preview(&doc);

        if let Some(agent) = plan.tunnel_service.clone() {
            doc.services.insert(self.config.service_name.clone(), agent);
        }
        if plan.add_default_network {
            doc.networks
                .insert(self.config.default_network.clone(), self.default_network());
        }
        for service_name in &plan.add_network_membership {
            if let Some(service) = doc.services.get_mut(service_name) {
                service.networks.add(&self.config.default_network);
            }
        }

        let mut report = self.validate(&doc);
        report.applied = plan.changes;
        debug!(
            "Tunnel injection applied {} change(s), valid={}",
            report.applied.len(),
            report.valid
        );
        (doc, report)
    }

    /// Parse, inject and serialize Compose source
    pub fn inject_source(&self, source: &str) -> Result<(String, ValidationReport), DockyardError> {
        let doc = ComposeDocument::parse(source)?;
        let (doc, report) = self.inject(doc);
        Ok((doc.to_yaml()?, report))
    }

    /// Contract violations of an existing agent service
    fn agent_issues(&self, service: &ServiceSpec) -> Vec<String> {
        let name = &self.config.service_name;
        let mut issues = Vec::new();

        match service.image.as_deref() {
            None | Some("") => issues.push(format!("{} service missing image", name)),
            Some(image) if !self.is_agent_image(image) => {
                issues.push(format!("{} service using incorrect image: {}", name, image))
            }
            Some(_) => {}
        }

        let missing: Vec<&str> = REQUIRED_ENV
            .iter()
            .copied()
            .filter(|key| {
                let prefix = format!("{}=", key);
                !service.environment.iter().any(|e| e.starts_with(&prefix))
            })
            .collect();
        if !missing.is_empty() {
            issues.push(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            ));
        }

        let socket_mounts: Vec<&MountSpec> = service
            .volumes
            .iter()
            .filter(|m| m.source().as_deref() == Some(self.config.docker_socket.as_str()))
            .collect();
        if socket_mounts.is_empty() {
            issues.push(format!("{} service missing Docker socket mount", name));
        } else if !socket_mounts.iter().any(|m| m.read_only()) {
            issues.push(format!(
                "{} service must mount the Docker socket read-only",
                name
            ));
        }

        issues
    }

    fn is_agent_image(&self, image: &str) -> bool {
        if image.contains(AGENT_IMAGE_MARKER) {
            return true;
        }
        let repository = self
            .config
            .image
            .rsplit_once(':')
            .map(|(repo, _)| repo)
            .unwrap_or(self.config.image.as_str());
        image.starts_with(repository)
    }

    fn check_networks(&self, doc: &ComposeDocument, report: &mut ValidationReport) {
        if doc.networks.is_empty() {
            report.network_ok = false;
            report
                .warnings
                .push("no networks defined - services may not be able to communicate".to_string());
            return;
        }

        let unnetworked: Vec<&str> = doc
            .services
            .iter()
            .filter(|(_, s)| joins_networks(s) && s.networks.is_empty())
            .map(|(name, _)| name.as_str())
            .collect();
        if !unnetworked.is_empty() {
            report.network_ok = false;
            report.warnings.push(format!(
                "services without network configuration: {}",
                unnetworked.join(", ")
            ));
        }

        for (name, service) in &doc.services {
            for network in service.networks.names() {
                if network != "default" && !doc.networks.contains_key(&network) {
                    report.network_ok = false;
                    report.warnings.push(format!(
                        "service {} references undeclared network {}",
                        name, network
                    ));
                }
            }
        }
    }

    /// The agent service as this injector would write it
    pub fn agent_service(&self) -> ServiceSpec {
        let image = self
            .credentials
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| self.config.image.clone());

        let labels: BTreeMap<String, String> = [
            ("app.type", "tunnel"),
            ("app.name", self.config.service_name.as_str()),
            ("app.managed", "true"),
            ("traefik.enable", "false"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        ServiceSpec {
            image: Some(image),
            container_name: Some(self.config.service_name.clone()),
            restart: Some(self.config.restart_policy.clone()),
            environment: vec![
                format!("{}={}", ENDPOINT_ENV, self.credentials.endpoint),
                format!("{}={}", AGENT_ID_ENV, self.credentials.newt_id),
                format!("{}={}", AGENT_SECRET_ENV, self.credentials.secret),
                format!("LOG_LEVEL={}", self.config.agent_log_level),
                format!("HEALTH_FILE={}", self.config.health_file),
            ],
            volumes: vec![MountSpec::Short(format!(
                "{0}:{0}:ro",
                self.config.docker_socket
            ))],
            networks: ServiceNetworks::List(vec![self.config.default_network.clone()]),
            healthcheck: Some(HealthCheck {
                test: vec![
                    "CMD".to_string(),
                    "test".to_string(),
                    "-f".to_string(),
                    self.config.health_file.clone(),
                ],
                interval: Some("30s".to_string()),
                timeout: Some("10s".to_string()),
                retries: Some(3),
                start_period: Some("60s".to_string()),
                extra: BTreeMap::new(),
            }),
            labels,
            ..Default::default()
        }
    }

    fn default_network(&self) -> NetworkSpec {
        NetworkSpec {
            driver: Some("bridge".to_string()),
            labels: BTreeMap::from([("app.managed".to_string(), "true".to_string())]),
            extra: BTreeMap::new(),
        }
    }
}

/// Services using `network_mode` cannot join networks
fn joins_networks(service: &ServiceSpec) -> bool {
    !service.extra.contains_key("network_mode")
}

fn check_port_collisions(doc: &ComposeDocument, report: &mut ValidationReport) {
    let mut owners: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (name, service) in &doc.services {
        for port in service.host_ports() {
            let users = owners.entry(port).or_default();
            if !users.contains(&name.as_str()) {
                users.push(name);
            }
        }
    }
    for (port, services) in owners {
        if services.len() > 1 {
            report.warnings.push(format!(
                "Port {} is used by multiple services: {}",
                port,
                services.join(", ")
            ));
        }
    }
}
