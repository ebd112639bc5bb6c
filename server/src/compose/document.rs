//! In-memory model of a Compose file.
//!
//! Only the keys the injector and the backup engine reason about are typed.
//! Everything else is carried through `extra` maps so a parse and serialize
//! round trip does not drop user configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::errors::DockyardError;

/// A parsed Compose document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeDocument {
    /// Schema version, kept verbatim when present
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de::opt_scalar"
    )]
    pub version: Option<String>,

    #[serde(default, deserialize_with = "de::null_values_as_default")]
    pub services: BTreeMap<String, ServiceSpec>,

    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "de::null_values_as_default"
    )]
    pub networks: BTreeMap<String, NetworkSpec>,

    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "de::null_values_as_default"
    )]
    pub volumes: BTreeMap<String, VolumeSpec>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ComposeDocument {
    /// Parse Compose YAML
    pub fn parse(source: &str) -> Result<Self, DockyardError> {
        if source.trim().is_empty() {
            return Err(DockyardError::ValidationError(
                "compose source is empty".to_string(),
            ));
        }
        Ok(serde_yaml::from_str(source)?)
    }

    /// Serialize back to Compose YAML
    pub fn to_yaml(&self) -> Result<String, DockyardError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Named volumes and the services that mount them
    pub fn named_volume_usage(&self) -> BTreeMap<String, Vec<String>> {
        let mut usage: BTreeMap<String, Vec<String>> = self
            .volumes
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();

        for (service_name, service) in &self.services {
            for mount in &service.volumes {
                if let Some(source) = mount.source() {
                    if let Some(users) = usage.get_mut(source.as_str()) {
                        users.push(service_name.clone());
                    }
                }
            }
        }
        usage
    }
}

/// A service definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,

    /// `KEY=VALUE` entries; map form is normalised into this list
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "de::list_or_map_entries"
    )]
    pub environment: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<MountSpec>,

    /// Network memberships, in whichever form the source used
    #[serde(
        default,
        skip_serializing_if = "ServiceNetworks::is_empty",
        deserialize_with = "de::service_networks"
    )]
    pub networks: ServiceNetworks,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,

    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "de::labels"
    )]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Value>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ServiceSpec {
    /// Environment as a map; entries without `=` map to an empty value
    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.environment
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (entry.clone(), String::new()),
            })
            .collect()
    }

    /// Whether the environment declares `key`
    pub fn has_env(&self, key: &str) -> bool {
        self.environment
            .iter()
            .any(|entry| entry.split('=').next() == Some(key))
    }

    pub fn has_network(&self, network: &str) -> bool {
        self.networks.contains(network)
    }

    /// Host ports this service publishes
    pub fn host_ports(&self) -> Vec<String> {
        self.ports.iter().filter_map(PortSpec::host_port).collect()
    }
}

/// Networks a service joins.
///
/// The map form carries per-network settings such as `aliases` or
/// `ipv4_address`, so it is kept as a map rather than flattened to names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceNetworks {
    List(Vec<String>),
    Map(BTreeMap<String, Value>),
}

impl Default for ServiceNetworks {
    fn default() -> Self {
        ServiceNetworks::List(Vec::new())
    }
}

impl ServiceNetworks {
    pub fn names(&self) -> Vec<String> {
        match self {
            ServiceNetworks::List(names) => names.clone(),
            ServiceNetworks::Map(map) => map.keys().cloned().collect(),
        }
    }

    pub fn contains(&self, network: &str) -> bool {
        match self {
            ServiceNetworks::List(names) => names.iter().any(|n| n == network),
            ServiceNetworks::Map(map) => map.contains_key(network),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ServiceNetworks::List(names) => names.is_empty(),
            ServiceNetworks::Map(map) => map.is_empty(),
        }
    }

    /// Join `network` with default settings; a no-op when already joined
    pub fn add(&mut self, network: &str) {
        if self.contains(network) {
            return;
        }
        match self {
            ServiceNetworks::List(names) => names.push(network.to_string()),
            ServiceNetworks::Map(map) => {
                map.insert(network.to_string(), Value::Null);
            }
        }
    }
}

/// A port mapping in short, numeric or long syntax
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Number(u64),
    Short(String),
    Long(BTreeMap<String, Value>),
}

impl PortSpec {
    /// Published host port, suffixed with the protocol unless it is tcp.
    ///
    /// Container-only mappings publish nothing fixed and yield `None`.
    pub fn host_port(&self) -> Option<String> {
        let (port, protocol) = match self {
            PortSpec::Number(_) => return None,
            PortSpec::Short(spec) => {
                let (mapping, protocol) = match spec.split_once('/') {
                    Some((mapping, protocol)) => (mapping, protocol.to_string()),
                    None => (spec.as_str(), "tcp".to_string()),
                };
                let parts: Vec<&str> = mapping.split(':').collect();
                if parts.len() < 2 {
                    return None;
                }
                (parts[parts.len() - 2].to_string(), protocol)
            }
            PortSpec::Long(map) => {
                let published = map.get("published").and_then(de::scalar_string)?;
                let protocol = map
                    .get("protocol")
                    .and_then(de::scalar_string)
                    .unwrap_or_else(|| "tcp".to_string());
                (published, protocol)
            }
        };

        if port.is_empty() {
            return None;
        }
        if protocol == "tcp" {
            Some(port)
        } else {
            Some(format!("{}/{}", port, protocol))
        }
    }
}

/// A volume mount in short or long syntax
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MountSpec {
    Short(String),
    Long(BTreeMap<String, Value>),
}

impl MountSpec {
    pub fn source(&self) -> Option<String> {
        match self {
            MountSpec::Short(spec) => {
                let mut parts = spec.split(':');
                let first = parts.next()?;
                parts.next().map(|_| first.to_string())
            }
            MountSpec::Long(map) => map.get("source").and_then(de::scalar_string),
        }
    }

    pub fn target(&self) -> Option<String> {
        match self {
            MountSpec::Short(spec) => {
                let parts: Vec<&str> = spec.split(':').collect();
                match parts.len() {
                    1 => Some(parts[0].to_string()),
                    _ => Some(parts[1].to_string()),
                }
            }
            MountSpec::Long(map) => map.get("target").and_then(de::scalar_string),
        }
    }

    pub fn read_only(&self) -> bool {
        match self {
            MountSpec::Short(spec) => {
                let parts: Vec<&str> = spec.split(':').collect();
                parts.len() >= 3 && parts[2].split(',').any(|opt| opt == "ro")
            }
            MountSpec::Long(map) => matches!(map.get("read_only"), Some(Value::Bool(true))),
        }
    }
}

/// Container health check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Command; a plain string is normalised to `["CMD-SHELL", <string>]`
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "de::string_or_list"
    )]
    pub test: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A top-level network
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "de::labels"
    )]
    pub labels: BTreeMap<String, String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A top-level named volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "de::labels"
    )]
    pub labels: BTreeMap<String, String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

mod de {
    use std::collections::BTreeMap;

    use serde::de::{DeserializeOwned, Error};
    use serde::{Deserialize, Deserializer};
    use serde_yaml::Value;

    pub fn scalar_string(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn opt_scalar<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let value = Value::deserialize(d)?;
        match value {
            Value::Null => Ok(None),
            other => scalar_string(&other)
                .map(Some)
                .ok_or_else(|| D::Error::custom("expected a scalar value")),
        }
    }

    /// `name:` with no body is a valid entry meaning "all defaults"
    pub fn null_values_as_default<'de, D, T>(d: D) -> Result<BTreeMap<String, T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned + Default,
    {
        let map = Option::<BTreeMap<String, Option<T>>>::deserialize(d)?;
        Ok(map
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.unwrap_or_default()))
            .collect())
    }

    pub fn list_or_map_entries<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(Vec::new()),
            Value::Sequence(items) => items
                .iter()
                .map(|item| {
                    scalar_string(item).ok_or_else(|| D::Error::custom("list entries must be scalars"))
                })
                .collect(),
            Value::Mapping(map) => map
                .iter()
                .map(|(key, value)| {
                    let key = scalar_string(key)
                        .ok_or_else(|| D::Error::custom("mapping keys must be scalars"))?;
                    match value {
                        Value::Null => Ok(key),
                        other => {
                            let value = scalar_string(other).ok_or_else(|| {
                                D::Error::custom("mapping values must be scalars")
                            })?;
                            Ok(format!("{}={}", key, value))
                        }
                    }
                })
                .collect(),
            _ => Err(D::Error::custom("expected a list or a mapping")),
        }
    }

    pub fn service_networks<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<super::ServiceNetworks, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(super::ServiceNetworks::default()),
            Value::Sequence(items) => items
                .iter()
                .map(|item| {
                    scalar_string(item).ok_or_else(|| D::Error::custom("list entries must be scalars"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(super::ServiceNetworks::List),
            Value::Mapping(map) => map
                .into_iter()
                .map(|(key, value)| {
                    scalar_string(&key)
                        .map(|key| (key, value))
                        .ok_or_else(|| D::Error::custom("mapping keys must be scalars"))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(super::ServiceNetworks::Map),
            _ => Err(D::Error::custom("expected a list or a mapping")),
        }
    }

    pub fn labels<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<String, String>, D::Error> {
        let entries = list_or_map_entries(d)?;
        Ok(entries
            .into_iter()
            .map(|entry| match entry.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (entry, String::new()),
            })
            .collect())
    }

    pub fn string_or_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(Vec::new()),
            Value::String(command) => Ok(vec!["CMD-SHELL".to_string(), command]),
            Value::Sequence(items) => items
                .iter()
                .map(|item| {
                    scalar_string(item).ok_or_else(|| D::Error::custom("list entries must be scalars"))
                })
                .collect(),
            _ => Err(D::Error::custom("expected a string or a list")),
        }
    }
}
