use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::cli::CliArgs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub source: Option<String>,
    pub bind: SocketAddr,
    pub executable: String,
    pub command_timeout_ms: u64,
    pub allowed_origins: Vec<String>,
    pub stream_channel_capacity: usize,
    pub update_channel_capacity: usize,
    pub stream_subscribe_grace_ms: u64,
    pub rollout_settle_ms: u64,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            source: None,
            bind: default_bind(),
            executable: default_executable(),
            command_timeout_ms: default_command_timeout_ms(),
            allowed_origins: default_allowed_origins(),
            stream_channel_capacity: default_stream_channel_capacity(),
            update_channel_capacity: default_update_channel_capacity(),
            stream_subscribe_grace_ms: default_stream_subscribe_grace_ms(),
            rollout_settle_ms: default_rollout_settle_ms(),
            scratch_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct KubecmdsConfigFile {
    #[serde(default)]
    bind: Option<SocketAddr>,
    #[serde(default, alias = "kubectl")]
    executable: Option<String>,
    #[serde(default, alias = "timeout_ms", alias = "timeout")]
    command_timeout_ms: Option<u64>,
    #[serde(default, alias = "cors_origins")]
    allowed_origins: Option<Vec<String>>,
    #[serde(default)]
    stream_channel_capacity: Option<usize>,
    #[serde(default)]
    update_channel_capacity: Option<usize>,
    #[serde(default)]
    stream_subscribe_grace_ms: Option<u64>,
    #[serde(default)]
    rollout_settle_ms: Option<u64>,
    #[serde(default)]
    scratch_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Config file values layered over defaults, then CLI flags over both.
    pub fn resolve(args: &CliArgs) -> Result<Self> {
        let path = args.config.clone().or_else(discover_config_path);
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(bind) = args.bind {
            config.bind = bind;
        }
        if let Some(executable) = &args.executable {
            config.executable = executable.clone();
        }
        if let Some(timeout_ms) = args.timeout_ms {
            config.command_timeout_ms = timeout_ms;
        }
        Ok(config)
    }

    pub fn load(path: PathBuf) -> Result<Self> {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config = Self::from_yaml(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.source = Some(path.display().to_string());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let parsed: KubecmdsConfigFile = if raw.trim().is_empty() {
            KubecmdsConfigFile::default()
        } else {
            serde_yaml::from_str(raw)?
        };

        let defaults = Self::default();
        let executable = parsed
            .executable
            .filter(|executable| !executable.trim().is_empty())
            .unwrap_or(defaults.executable);
        Ok(Self {
            source: None,
            bind: parsed.bind.unwrap_or(defaults.bind),
            executable,
            command_timeout_ms: parsed
                .command_timeout_ms
                .unwrap_or(defaults.command_timeout_ms),
            allowed_origins: parsed.allowed_origins.unwrap_or(defaults.allowed_origins),
            stream_channel_capacity: parsed
                .stream_channel_capacity
                .unwrap_or(defaults.stream_channel_capacity),
            update_channel_capacity: parsed
                .update_channel_capacity
                .unwrap_or(defaults.update_channel_capacity),
            stream_subscribe_grace_ms: parsed
                .stream_subscribe_grace_ms
                .unwrap_or(defaults.stream_subscribe_grace_ms),
            rollout_settle_ms: parsed.rollout_settle_ms.unwrap_or(defaults.rollout_settle_ms),
            scratch_dir: parsed.scratch_dir,
        })
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_executable() -> String {
    "kubectl".to_string()
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:4200".to_string(),
        "https://kubevisualize.jialin00.com".to_string(),
    ]
}

fn default_stream_channel_capacity() -> usize {
    1024
}

fn default_update_channel_capacity() -> usize {
    256
}

fn default_stream_subscribe_grace_ms() -> u64 {
    10_000
}

fn default_rollout_settle_ms() -> u64 {
    1_000
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KUBECMDS_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("kubecmds.yaml"),
        PathBuf::from("kubecmds.yml"),
        PathBuf::from(".kubecmds.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/kubecmds/config.yaml"),
            PathBuf::from(&home).join(".config/kubecmds/config.yml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::ServerConfig;
    use crate::cli::CliArgs;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ServerConfig::from_yaml("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.executable, "kubectl");
        assert_eq!(config.command_timeout_ms, 30_000);
    }

    #[test]
    fn file_values_override_defaults() {
        let config = ServerConfig::from_yaml(
            "bind: 0.0.0.0:8090\ntimeout_ms: 5000\nallowed_origins: [\"http://localhost:8080\"]\n",
        )
        .unwrap();

        assert_eq!(config.bind.port(), 8090);
        assert_eq!(config.command_timeout_ms, 5_000);
        assert_eq!(config.allowed_origins, vec!["http://localhost:8080"]);
        assert_eq!(config.stream_channel_capacity, 1024);
        assert_eq!(config.rollout_settle_ms, 1_000);
    }

    #[test]
    fn blank_executable_falls_back_to_kubectl() {
        let config = ServerConfig::from_yaml("executable: \"  \"\n").unwrap();
        assert_eq!(config.executable, "kubectl");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ServerConfig::from_yaml("plugins: []\n").is_err());
    }

    #[test]
    fn cli_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind: 127.0.0.1:4000\ncommand_timeout_ms: 1000").unwrap();
        let path = file.path().display().to_string();

        let args = CliArgs::parse_from(["kubecmds", "--config", &path, "--timeout-ms", "2500"]);
        let config = ServerConfig::resolve(&args).unwrap();

        assert_eq!(config.bind.port(), 4000);
        assert_eq!(config.command_timeout_ms, 2_500);
        assert_eq!(config.source.as_deref(), Some(path.as_str()));
    }
}
