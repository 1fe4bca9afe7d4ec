use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::{Cli, EmbedDevice};

pub const DEFAULT_BACKEND_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_EMBED_MODEL: &str = "feature-hash-256";
pub const RAG_SERVER_BIN: &str = "scantree-rag-server";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub backend_url: String,
    pub model: Option<String>,
    pub service: Option<String>,
    pub docs: Vec<String>,
    pub temperature: f32,
    pub max_plan_iterations: usize,
    pub max_tool_iterations: usize,
    pub embed_model: String,
    pub embed_device: EmbedDevice,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub default_top_k: usize,
    pub persist_dir: String,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
    pub tool_servers: Vec<ToolServerConfig>,
}

impl RuntimeConfig {
    pub fn require_model(&self) -> Result<&str> {
        self.model.as_deref().ok_or_else(|| {
            anyhow::anyhow!("a model is required. Set --model, SCANTREE_MODEL, or profile.model.")
        })
    }
}

/// Launch configuration for one tool server subprocess. This is the typed
/// value the Transport validates and serializes into the flag encoding the
/// server binary parses.
#[derive(Debug, Clone)]
pub struct ToolServerConfig {
    pub id: String,
    pub command: Option<String>,
    pub docs: Vec<String>,
    pub embed_model: String,
    pub embed_device: EmbedDevice,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub default_top_k: usize,
    pub persist_dir: String,
    pub log_file: Option<String>,
    pub enabled: bool,
}

impl ToolServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("tool server id cannot be empty");
        }
        if self.docs.is_empty() {
            anyhow::bail!("tool server '{}' has no document paths configured", self.id);
        }
        if self.chunk_size == 0 {
            anyhow::bail!("tool server '{}' has chunk_size 0", self.id);
        }
        if self.chunk_overlap >= self.chunk_size {
            anyhow::bail!(
                "tool server '{}' has chunk_overlap {} >= chunk_size {}",
                self.id,
                self.chunk_overlap,
                self.chunk_size
            );
        }
        if self.default_top_k == 0 {
            anyhow::bail!("tool server '{}' has default_top_k 0", self.id);
        }
        Ok(())
    }

    /// Stable flag encoding understood by the server binary.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = vec!["--server-name".to_string(), self.id.clone(), "--docs".to_string()];
        argv.extend(self.docs.iter().cloned());
        argv.extend([
            "--embed-model".to_string(),
            self.embed_model.clone(),
            "--embed-device".to_string(),
            self.embed_device.as_str().to_string(),
            "--chunk-size".to_string(),
            self.chunk_size.to_string(),
            "--chunk-overlap".to_string(),
            self.chunk_overlap.to_string(),
            "--default-top-k".to_string(),
            self.default_top_k.to_string(),
            "--persist-dir".to_string(),
            self.persist_dir.clone(),
        ]);
        if let Some(log_file) = &self.log_file {
            argv.extend(["--log-file".to_string(), log_file.clone()]);
        }
        argv
    }

    /// Explicit command when configured, otherwise the server binary shipped
    /// next to the current executable.
    pub fn resolve_command(&self) -> Result<PathBuf> {
        if let Some(command) = &self.command {
            return Ok(PathBuf::from(command));
        }

        let current = std::env::current_exe().context("failed to resolve current executable")?;
        let dir = current
            .parent()
            .context("current executable has no parent directory")?;
        Ok(dir.join(RAG_SERVER_BIN))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub backend_url: Option<String>,
    pub model: Option<String>,
    pub service: Option<String>,
    #[serde(default)]
    pub docs: Vec<String>,
    pub temperature: Option<f32>,
    pub max_plan_iterations: Option<usize>,
    pub max_tool_iterations: Option<usize>,
    pub embed_model: Option<String>,
    pub embed_device: Option<EmbedDevice>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub default_top_k: Option<usize>,
    pub persist_dir: Option<String>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerProfile>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolServerProfile {
    pub id: String,
    pub command: Option<String>,
    #[serde(default)]
    pub docs: Vec<String>,
    pub embed_model: Option<String>,
    pub embed_device: Option<EmbedDevice>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub default_top_k: Option<usize>,
    pub persist_dir: Option<String>,
    pub log_file: Option<String>,
    pub enabled: Option<bool>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check field names and value types.",
            path.display()
        )
    })
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    let docs = if cli.docs.is_empty() {
        profile.docs.clone()
    } else {
        cli.docs.clone()
    };

    let mut cfg = RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        backend_url: cli
            .backend_url
            .clone()
            .or(profile.backend_url)
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
        model: cli.model.clone().or(profile.model),
        service: cli.service.clone().or(profile.service),
        docs,
        temperature: cli.temperature.or(profile.temperature).unwrap_or(0.3),
        max_plan_iterations: cli
            .max_plan_iterations
            .or(profile.max_plan_iterations)
            .unwrap_or(10)
            .max(1),
        max_tool_iterations: cli
            .max_tool_iterations
            .or(profile.max_tool_iterations)
            .unwrap_or(5)
            .max(1),
        embed_model: cli
            .embed_model
            .clone()
            .or(profile.embed_model)
            .unwrap_or_else(|| DEFAULT_EMBED_MODEL.to_string()),
        embed_device: cli
            .embed_device
            .or(profile.embed_device)
            .unwrap_or(EmbedDevice::Cpu),
        chunk_size: cli.chunk_size.or(profile.chunk_size).unwrap_or(1024).max(1),
        chunk_overlap: cli.chunk_overlap.or(profile.chunk_overlap).unwrap_or(128),
        default_top_k: cli
            .default_top_k
            .or(profile.default_top_k)
            .unwrap_or(5)
            .max(1),
        persist_dir: cli
            .persist_dir
            .clone()
            .or(profile.persist_dir)
            .unwrap_or_else(|| ".scantree/index".to_string()),
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(false),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".scantree/telemetry.jsonl".to_string()),
        tool_servers: Vec::new(),
    };

    cfg.tool_servers = if profile.tool_servers.is_empty() {
        default_tool_servers(&cfg)
    } else {
        profile
            .tool_servers
            .iter()
            .map(|server| resolve_tool_server(server, &cfg))
            .collect()
    };

    Ok(cfg)
}

/// With no explicit server table, the configured documents back a single
/// retrieval server, as the planner expects.
fn default_tool_servers(cfg: &RuntimeConfig) -> Vec<ToolServerConfig> {
    if cfg.docs.is_empty() {
        return Vec::new();
    }

    vec![ToolServerConfig {
        id: "service-docs".to_string(),
        command: None,
        docs: cfg.docs.clone(),
        embed_model: cfg.embed_model.clone(),
        embed_device: cfg.embed_device,
        chunk_size: cfg.chunk_size,
        chunk_overlap: cfg.chunk_overlap,
        default_top_k: cfg.default_top_k,
        persist_dir: cfg.persist_dir.clone(),
        log_file: None,
        enabled: true,
    }]
}

fn resolve_tool_server(server: &ToolServerProfile, cfg: &RuntimeConfig) -> ToolServerConfig {
    let docs = if server.docs.is_empty() {
        cfg.docs.clone()
    } else {
        server.docs.clone()
    };

    ToolServerConfig {
        id: server.id.clone(),
        command: server.command.clone(),
        docs,
        embed_model: server
            .embed_model
            .clone()
            .unwrap_or_else(|| cfg.embed_model.clone()),
        embed_device: server.embed_device.unwrap_or(cfg.embed_device),
        chunk_size: server.chunk_size.unwrap_or(cfg.chunk_size),
        chunk_overlap: server.chunk_overlap.unwrap_or(cfg.chunk_overlap),
        default_top_k: server.default_top_k.unwrap_or(cfg.default_top_k),
        persist_dir: server
            .persist_dir
            .clone()
            .unwrap_or_else(|| cfg.persist_dir.clone()),
        log_file: server.log_file.clone(),
        enabled: server.enabled.unwrap_or(true),
    }
}
