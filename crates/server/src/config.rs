use anyhow::{Context, Result};
use brain_indexer::{LoaderConfig, NotifierConfig, ResyncDriverConfig};
use brain_query_cache::CacheConfig;
use brain_rate_limit::RateLimitConfig;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "brain-server",
    version,
    about = "Second Brain daemon: watch a folder of notes, index it, answer questions"
)]
pub struct Cli {
    /// Folder of documents to index and watch (default: ~/SecondBrain)
    #[arg(long, env = "BRAIN_FOLDER")]
    pub path: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "BRAIN_LISTEN", default_value = "127.0.0.1:8000")]
    pub listen: String,

    /// Optional TOML settings file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Rebuild the index from scratch on startup
    #[arg(long)]
    pub rebuild: bool,
}

/// Tunables, loadable from a TOML file. CLI flags and environment variables
/// win over the file; the file wins over these defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub debounce_ms: u64,
    pub max_batch_wait_ms: u64,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    pub requests_per_minute: u32,
    pub idle_horizon_secs: u64,
    pub allowed_extensions: Vec<String>,
    pub max_file_mb: u64,
    pub chunk_chars: usize,
    pub chunk_overlap: usize,
    pub ignore_patterns: Vec<String>,
    pub embedding_dimension: usize,
    pub embed_timeout_secs: u64,
    pub ollama_host: String,
    pub ollama_model: String,
    pub generation_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let loader = LoaderConfig::default();
        let mut allowed_extensions: Vec<String> =
            loader.allowed_extensions.into_iter().collect();
        allowed_extensions.sort();

        Self {
            debounce_ms: 1000,
            max_batch_wait_ms: 5000,
            cache_capacity: 100,
            cache_ttl_secs: 3600,
            requests_per_minute: 60,
            idle_horizon_secs: 600,
            allowed_extensions,
            max_file_mb: 80,
            chunk_chars: loader.chunk_chars,
            chunk_overlap: loader.chunk_overlap,
            ignore_patterns: Vec::new(),
            embedding_dimension: 256,
            embed_timeout_secs: 10,
            ollama_host: "http://localhost:11434".to_string(),
            ollama_model: "llama3".to_string(),
            generation_timeout_secs: 300,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            allowed_extensions: self
                .allowed_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            max_file_bytes: self.max_file_mb * 1024 * 1024,
            chunk_chars: self.chunk_chars,
            chunk_overlap: self.chunk_overlap,
            ignore_patterns: self.ignore_patterns.clone(),
        }
    }

    #[must_use]
    pub fn notifier_config(&self) -> NotifierConfig {
        NotifierConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            max_batch_wait: Duration::from_millis(self.max_batch_wait_ms),
        }
    }

    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache_capacity,
            ttl: Duration::from_secs(self.cache_ttl_secs),
        }
    }

    #[must_use]
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let mut config = RateLimitConfig::per_minute(self.requests_per_minute);
        config.idle_horizon = Duration::from_secs(self.idle_horizon_secs);
        config
    }

    #[must_use]
    pub fn driver_config(&self) -> ResyncDriverConfig {
        ResyncDriverConfig {
            embed_timeout: Duration::from_secs(self.embed_timeout_secs),
            ..ResyncDriverConfig::default()
        }
    }
}

#[derive(Debug)]
pub struct ResolvedConfig {
    pub root: PathBuf,
    pub listen: SocketAddr,
    pub settings: Settings,
    pub rebuild_on_start: bool,
}

pub fn resolve(cli: Cli) -> Result<ResolvedConfig> {
    let mut settings = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading settings file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parsing settings file {}", path.display()))?
        }
        None => Settings::default(),
    };

    for (var, slot) in [
        ("OLLAMA_HOST", &mut settings.ollama_host),
        ("OLLAMA_MODEL", &mut settings.ollama_model),
    ] {
        if let Ok(value) = std::env::var(var) {
            let value = value.trim();
            if !value.is_empty() {
                *slot = value.to_string();
            }
        }
    }

    let root = cli.path.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("SecondBrain")
    });
    let listen: SocketAddr = cli
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", cli.listen))?;

    Ok(ResolvedConfig {
        root,
        listen,
        settings,
        rebuild_on_start: cli.rebuild,
    })
}
