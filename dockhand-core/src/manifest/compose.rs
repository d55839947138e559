//! Compose file format types.
//!
//! Matches the subset of the Compose specification this tool reads and
//! rewrites. Unknown keys are preserved through flattened maps so a
//! rewritten manifest keeps everything the user wrote, and all maps are
//! ordered so rewriting is deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root structure of a compose manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeFile {
    /// Compose file format version (e.g., "3.8"). Optional since v2 spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Services to be created
    pub services: BTreeMap<String, Service>,

    /// Named volumes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Option<VolumeDefinition>>,

    /// Networks
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, Option<NetworkDefinition>>,

    /// Top-level keys this tool does not interpret
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// A service in a compose manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    /// Container image to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Build configuration, short or long form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,

    /// Explicit container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    /// Port mappings (e.g., ["8080:80"])
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,

    /// Environment variables
    #[serde(default, skip_serializing_if = "Environment::is_empty")]
    pub environment: Environment,

    /// Volume mounts in short syntax (e.g., ["./src:/app/src", "db:/data"])
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    /// Networks to connect to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,

    /// Services this service depends on
    #[serde(default, skip_serializing_if = "DependsOn::is_empty")]
    pub depends_on: DependsOn,

    /// Override the default command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,

    /// Override the default entrypoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Command>,

    /// Working directory inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// User to run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Metadata labels
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,

    /// Service keys this tool does not interpret
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Build configuration, short form (context path) or long form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum BuildSpec {
    /// `build: ./dir`
    Context(String),
    /// `build: { context: ..., dockerfile: ..., target: ... }`
    Detailed(BuildDetail),
}

/// Long-form build configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BuildDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    /// Stage to build in a multi-stage build file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl BuildSpec {
    /// Build context directory, relative to the manifest.
    pub fn context(&self) -> &str {
        match self {
            BuildSpec::Context(path) => path,
            BuildSpec::Detailed(d) => d.context.as_deref().unwrap_or("."),
        }
    }

    /// Build file path relative to the context.
    pub fn dockerfile(&self) -> &str {
        match self {
            BuildSpec::Context(_) => "Dockerfile",
            BuildSpec::Detailed(d) => d.dockerfile.as_deref().unwrap_or("Dockerfile"),
        }
    }

    /// Target stage, if one is selected.
    pub fn target(&self) -> Option<&str> {
        match self {
            BuildSpec::Context(_) => None,
            BuildSpec::Detailed(d) => d.target.as_deref(),
        }
    }
}

/// Environment variables as a map or list of KEY=value strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Environment {
    Map(BTreeMap<String, Option<String>>),
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Map(BTreeMap::new())
    }
}

impl Environment {
    pub fn is_empty(&self) -> bool {
        match self {
            Environment::Map(m) => m.is_empty(),
            Environment::List(l) => l.is_empty(),
        }
    }

    /// Resolve to a map regardless of input format. List entries without a
    /// value pass the host value through, represented here as None.
    pub fn to_map(&self) -> BTreeMap<String, Option<String>> {
        match self {
            Environment::Map(map) => map.clone(),
            Environment::List(list) => list
                .iter()
                .map(|s| match s.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (s.to_string(), None),
                })
                .collect(),
        }
    }

    /// Set a variable in place, preserving the declared format.
    pub fn set(&mut self, key: &str, value: &str) {
        match self {
            Environment::Map(map) => {
                map.insert(key.to_string(), Some(value.to_string()));
            }
            Environment::List(list) => {
                let prefix = format!("{key}=");
                list.retain(|entry| entry != key && !entry.starts_with(&prefix));
                list.push(format!("{key}={value}"));
            }
        }
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<String> {
        self.to_map().get(key).cloned().flatten()
    }
}

/// `depends_on` as a list of names or a map with conditions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, DependsOnCondition>),
}

impl Default for DependsOn {
    fn default() -> Self {
        DependsOn::List(Vec::new())
    }
}

impl DependsOn {
    pub fn is_empty(&self) -> bool {
        match self {
            DependsOn::List(l) => l.is_empty(),
            DependsOn::Map(m) => m.is_empty(),
        }
    }

    /// Names of the services depended on.
    pub fn names(&self) -> Vec<String> {
        match self {
            DependsOn::List(l) => l.clone(),
            DependsOn::Map(m) => m.keys().cloned().collect(),
        }
    }
}

/// Long-form `depends_on` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DependsOnCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Command or entrypoint in shell or exec form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Command {
    Shell(String),
    Exec(Vec<String>),
}

impl Command {
    /// Flat text of the command, used for runtime detection.
    pub fn text(&self) -> String {
        match self {
            Command::Shell(s) => s.clone(),
            Command::Exec(args) => args.join(" "),
        }
    }
}

/// Labels as a map or list of key=value strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Labels {
    Map(BTreeMap<String, String>),
    List(Vec<String>),
}

impl Default for Labels {
    fn default() -> Self {
        Labels::Map(BTreeMap::new())
    }
}

impl Labels {
    pub fn is_empty(&self) -> bool {
        match self {
            Labels::Map(m) => m.is_empty(),
            Labels::List(l) => l.is_empty(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self {
            Labels::Map(m) => m.get(key).cloned(),
            Labels::List(l) => l.iter().find_map(|entry| {
                entry
                    .split_once('=')
                    .filter(|(k, _)| *k == key)
                    .map(|(_, v)| v.to_string())
            }),
        }
    }

    /// Set a label in place, preserving the declared format.
    pub fn set(&mut self, key: &str, value: &str) {
        match self {
            Labels::Map(m) => {
                m.insert(key.to_string(), value.to_string());
            }
            Labels::List(l) => {
                let prefix = format!("{key}=");
                l.retain(|entry| !entry.starts_with(&prefix));
                l.push(format!("{key}={value}"));
            }
        }
    }
}

/// Named volume definition. Usually `null` in manifests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub driver_opts: BTreeMap<String, String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Network definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// One entry of a service's short-syntax `volumes` list.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeMount {
    /// `./src:/app/src` or `/abs:/app:ro`
    Bind { source: String, target: String, options: Option<String> },
    /// `dbdata:/var/lib/db`
    Named { volume: String, target: String, options: Option<String> },
    /// `/anonymous`
    Anonymous { target: String },
}

impl VolumeMount {
    /// Parse a short-syntax volume entry.
    pub fn parse(entry: &str) -> Self {
        let parts: Vec<&str> = entry.splitn(3, ':').collect();
        match parts.as_slice() {
            [target] => VolumeMount::Anonymous { target: target.to_string() },
            [source, rest @ ..] => {
                let target = rest[0].to_string();
                let options = rest.get(1).map(|s| s.to_string());
                if source.starts_with('.') || source.starts_with('/') || source.starts_with('~') {
                    VolumeMount::Bind { source: source.to_string(), target, options }
                } else {
                    VolumeMount::Named { volume: source.to_string(), target, options }
                }
            }
            [] => VolumeMount::Anonymous { target: entry.to_string() },
        }
    }

    /// Mount point inside the container.
    pub fn target(&self) -> &str {
        match self {
            VolumeMount::Bind { target, .. } => target,
            VolumeMount::Named { target, .. } => target,
            VolumeMount::Anonymous { target } => target,
        }
    }

    /// Render back to short syntax.
    pub fn render(&self) -> String {
        match self {
            VolumeMount::Bind { source, target, options }
            | VolumeMount::Named { volume: source, target, options } => match options {
                Some(opts) => format!("{source}:{target}:{opts}"),
                None => format!("{source}:{target}"),
            },
            VolumeMount::Anonymous { target } => target.clone(),
        }
    }
}
