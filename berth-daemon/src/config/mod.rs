//! Configuration for the berth daemon.
//!
//! The config file declares the managed containers (image, ports, env,
//! lifecycle scripts) and named groups. Resolution turns a container name
//! into everything the executor needs: a creation spec plus the ordered
//! script list per lifecycle phase (convention-located default script first,
//! then the config-declared custom one).

mod duration;

pub use duration::{format_duration, parse_duration};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use berth_protocol::protocol::{ScriptOrigin, ScriptPhase};
use serde::Deserialize;

use crate::errors::{DaemonError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "berth.yaml";

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct BerthConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub containers: HashMap<String, ContainerConfig>,
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,
    /// Directory of the config file; relative script paths resolve here.
    #[serde(skip)]
    config_dir: PathBuf,
}

/// Tunables for operations and script execution.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Per-attempt timeout for `post_start` scripts.
    #[serde(default = "default_script_timeout", deserialize_with = "duration::deserialize_duration")]
    pub init_timeout: Duration,
    /// Per-attempt timeout for `pre_stop` scripts.
    #[serde(default = "default_script_timeout", deserialize_with = "duration::deserialize_duration")]
    pub halt_timeout: Duration,
    /// Bounded wait for a container to become observably running.
    #[serde(default = "default_observe_timeout", deserialize_with = "duration::deserialize_duration")]
    pub observe_timeout: Duration,
    /// Fixed pause between script attempts.
    #[serde(default = "default_retry_backoff", deserialize_with = "duration::deserialize_duration")]
    pub retry_backoff: Duration,
    /// Maximum script attempts per script.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Captured output cap per script attempt.
    #[serde(default = "default_max_output_lines")]
    pub max_output_lines: usize,
    /// Per-operation fan-out bound.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long settled operations stay pollable.
    #[serde(default = "default_retention", deserialize_with = "duration::deserialize_duration")]
    pub retention: Duration,
}

fn default_script_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_observe_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_output_lines() -> usize {
    100
}

fn default_concurrency() -> usize {
    8
}

fn default_retention() -> Duration {
    Duration::from_secs(3600)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            init_timeout: default_script_timeout(),
            halt_timeout: default_script_timeout(),
            observe_timeout: default_observe_timeout(),
            retry_backoff: default_retry_backoff(),
            max_attempts: default_max_attempts(),
            max_output_lines: default_max_output_lines(),
            concurrency: default_concurrency(),
            retention: default_retention(),
        }
    }
}

impl Settings {
    pub fn script_timeout(&self, phase: ScriptPhase) -> Duration {
        match phase {
            ScriptPhase::PostStart => self.init_timeout,
            ScriptPhase::PreStop => self.halt_timeout,
        }
    }
}

/// Per-container configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    /// Port bindings in `host:container` form.
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Volume bindings, named or host-path.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Shell the lifecycle scripts run under, inside the container.
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub scripts: LifecycleScripts,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Custom script slots for the two lifecycle phases.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LifecycleScripts {
    #[serde(default)]
    pub post_start: Option<ScriptSpec>,
    #[serde(default)]
    pub pre_stop: Option<ScriptSpec>,
}

impl LifecycleScripts {
    pub fn get(&self, phase: ScriptPhase) -> &Option<ScriptSpec> {
        match phase {
            ScriptPhase::PostStart => &self.post_start,
            ScriptPhase::PreStop => &self.pre_stop,
        }
    }
}

/// A custom script declaration: inline text or a path to a file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScriptSpec {
    Inline { run: String },
    External { path: PathBuf },
}

/// A named, ordered set of containers managed as one unit.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub description: Option<String>,
    pub members: Vec<String>,
    /// Start members strictly in declared order (dependency-sensitive stacks).
    #[serde(default)]
    pub sequential: bool,
}

/// Runtime-facing creation spec for a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub ports: Vec<String>,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<String>,
}

/// A lifecycle script resolved to executable text. The runner never branches
/// on origin; it only records it.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    pub origin: ScriptOrigin,
    pub body: String,
}

/// Everything the executor needs to act on one container.
#[derive(Debug, Clone)]
pub struct ResolvedContainer {
    pub name: String,
    /// `None` for containers bearing the managed label but absent from the
    /// current config; stop and remove still work on them.
    pub spec: Option<ContainerSpec>,
    pub shell: String,
    pub post_start: Vec<ScriptSource>,
    pub pre_stop: Vec<ScriptSource>,
}

impl ResolvedContainer {
    /// A target known only by its runtime label: no spec, no scripts.
    pub fn unresolved(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec: None,
            shell: default_shell(),
            post_start: Vec::new(),
            pre_stop: Vec::new(),
        }
    }

    pub fn scripts_for(&self, phase: ScriptPhase) -> &[ScriptSource] {
        match phase {
            ScriptPhase::PostStart => &self.post_start,
            ScriptPhase::PreStop => &self.pre_stop,
        }
    }
}

impl BerthConfig {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DaemonError::ConfigNotFound(path.to_path_buf())
            } else {
                DaemonError::Io(e)
            }
        })?;

        let mut config: BerthConfig =
            serde_yaml::from_str(&content).map_err(|e| DaemonError::ConfigParse {
                path: path.to_path_buf(),
                source: e,
            })?;

        config.config_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        config.validate()?;
        Ok(config)
    }

    /// Build a config directly from parts (tests, embedded use).
    pub fn from_parts(
        settings: Settings,
        containers: HashMap<String, ContainerConfig>,
        groups: HashMap<String, GroupConfig>,
        config_dir: PathBuf,
    ) -> Self {
        Self {
            settings,
            containers,
            groups,
            config_dir,
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, container) in &self.containers {
            if container.image.trim().is_empty() {
                return Err(DaemonError::Config(format!(
                    "container {} has an empty image",
                    name
                )));
            }
        }
        for (name, group) in &self.groups {
            if group.members.is_empty() {
                return Err(DaemonError::Config(format!("group {} has no members", name)));
            }
        }
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Resolve a container name into its spec plus ordered script lists.
    ///
    /// External custom scripts are read here so the script runner consumes a
    /// uniform list; an unreadable file is a validation error surfaced before
    /// any operation is created.
    pub fn resolve_container(&self, name: &str) -> Result<ResolvedContainer> {
        let container = self
            .containers
            .get(name)
            .ok_or_else(|| DaemonError::ContainerNotFound(name.to_string()))?;

        let spec = ContainerSpec {
            image: container.image.clone(),
            ports: container.ports.clone(),
            env: {
                let mut env: Vec<(String, String)> = container
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                env.sort();
                env
            },
            volumes: container.volumes.clone(),
        };

        let post_start = self.resolve_phase_scripts(name, container, ScriptPhase::PostStart)?;
        let pre_stop = self.resolve_phase_scripts(name, container, ScriptPhase::PreStop)?;

        Ok(ResolvedContainer {
            name: name.to_string(),
            spec: Some(spec),
            shell: container.shell.clone(),
            post_start,
            pre_stop,
        })
    }

    /// Ordered script list for one phase: default first, then custom.
    fn resolve_phase_scripts(
        &self,
        name: &str,
        container: &ContainerConfig,
        phase: ScriptPhase,
    ) -> Result<Vec<ScriptSource>> {
        let mut sources = Vec::new();

        let default_path = self
            .config_dir
            .join("scripts")
            .join(name)
            .join(format!("{}.sh", phase.as_str()));
        if default_path.is_file() {
            let body = std::fs::read_to_string(&default_path).map_err(|e| {
                DaemonError::Validation(format!(
                    "container {}: cannot read default {} script {}: {}",
                    name,
                    phase,
                    default_path.display(),
                    e
                ))
            })?;
            sources.push(ScriptSource {
                origin: ScriptOrigin::Default,
                body,
            });
        }

        if let Some(spec) = container.scripts.get(phase) {
            let body = match spec {
                ScriptSpec::Inline { run } => run.clone(),
                ScriptSpec::External { path } => {
                    let full = if path.is_absolute() {
                        path.clone()
                    } else {
                        self.config_dir.join(path)
                    };
                    std::fs::read_to_string(&full).map_err(|e| {
                        DaemonError::Validation(format!(
                            "container {}: cannot read {} script {}: {}",
                            name,
                            phase,
                            full.display(),
                            e
                        ))
                    })?
                }
            };
            sources.push(ScriptSource {
                origin: ScriptOrigin::Custom,
                body,
            });
        }

        Ok(sources)
    }

    pub fn resolve_group(&self, name: &str) -> Result<&GroupConfig> {
        self.groups
            .get(name)
            .ok_or_else(|| DaemonError::GroupNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let path = dir.join("berth.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
settings:
  init_timeout: 120s
  max_attempts: 5
containers:
  postgres:
    image: postgres:16
    ports: ["5432:5432"]
    env:
      POSTGRES_PASSWORD: dev
    volumes: ["pgdata:/var/lib/postgresql/data"]
    scripts:
      post_start:
        run: pg_isready -t 30
  redis:
    image: redis:7
groups:
  dev-stack:
    description: local development stack
    members: [postgres, redis]
    sequential: true
"#,
        );

        let config = BerthConfig::load(&path).unwrap();
        assert_eq!(config.settings.init_timeout, Duration::from_secs(120));
        assert_eq!(config.settings.max_attempts, 5);
        // Unset fields keep their defaults.
        assert_eq!(config.settings.halt_timeout, Duration::from_secs(300));
        assert_eq!(config.settings.concurrency, 8);

        assert_eq!(config.containers.len(), 2);
        let group = config.resolve_group("dev-stack").unwrap();
        assert_eq!(group.members, vec!["postgres", "redis"]);
        assert!(group.sequential);
    }

    #[test]
    fn missing_file_is_config_not_found() {
        let err = BerthConfig::load(Path::new("/nonexistent/berth.yaml")).unwrap_err();
        assert!(matches!(err, DaemonError::ConfigNotFound(_)));
    }

    #[test]
    fn unknown_container_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "containers:\n  web:\n    image: nginx\n");
        let config = BerthConfig::load(&path).unwrap();
        let err = config.resolve_container("db").unwrap_err();
        assert!(matches!(err, DaemonError::ContainerNotFound(_)));
    }

    #[test]
    fn unknown_group_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "containers:\n  web:\n    image: nginx\n");
        let config = BerthConfig::load(&path).unwrap();
        assert!(matches!(
            config.resolve_group("stack").unwrap_err(),
            DaemonError::GroupNotFound(_)
        ));
    }

    #[test]
    fn default_script_resolves_before_custom() {
        let dir = tempfile::tempdir().unwrap();
        let scripts_dir = dir.path().join("scripts").join("web");
        std::fs::create_dir_all(&scripts_dir).unwrap();
        std::fs::write(scripts_dir.join("post_start.sh"), "echo default").unwrap();

        let path = write_config(
            dir.path(),
            r#"
containers:
  web:
    image: nginx
    scripts:
      post_start:
        run: echo custom
"#,
        );

        let config = BerthConfig::load(&path).unwrap();
        let resolved = config.resolve_container("web").unwrap();
        let sources = resolved.scripts_for(ScriptPhase::PostStart);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].origin, ScriptOrigin::Default);
        assert_eq!(sources[0].body, "echo default");
        assert_eq!(sources[1].origin, ScriptOrigin::Custom);
        assert_eq!(sources[1].body, "echo custom");
    }

    #[test]
    fn external_script_is_read_at_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("backup.sh"), "pg_dump > /backup/db.sql").unwrap();
        let path = write_config(
            dir.path(),
            r#"
containers:
  postgres:
    image: postgres:16
    scripts:
      pre_stop:
        path: backup.sh
"#,
        );

        let config = BerthConfig::load(&path).unwrap();
        let resolved = config.resolve_container("postgres").unwrap();
        let sources = resolved.scripts_for(ScriptPhase::PreStop);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].origin, ScriptOrigin::Custom);
        assert!(sources[0].body.contains("pg_dump"));
    }

    #[test]
    fn unreadable_external_script_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
containers:
  postgres:
    image: postgres:16
    scripts:
      pre_stop:
        path: missing.sh
"#,
        );

        let config = BerthConfig::load(&path).unwrap();
        let err = config.resolve_container("postgres").unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));
    }

    #[test]
    fn no_scripts_resolves_to_empty_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "containers:\n  web:\n    image: nginx\n");
        let config = BerthConfig::load(&path).unwrap();
        let resolved = config.resolve_container("web").unwrap();
        assert!(resolved.scripts_for(ScriptPhase::PostStart).is_empty());
        assert!(resolved.scripts_for(ScriptPhase::PreStop).is_empty());
    }

    #[test]
    fn empty_image_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "containers:\n  web:\n    image: \"\"\n");
        assert!(matches!(
            BerthConfig::load(&path).unwrap_err(),
            DaemonError::Config(_)
        ));
    }
}
