use clap::Parser;
use inventory_sync_engine::EngineConfig;

/// A named row-service endpoint given as `NAME=URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    pub url: String,
}

fn parse_source(value: &str) -> Result<SourceSpec, String> {
    let (name, url) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=URL, got '{}'", value))?;
    let (name, url) = (name.trim(), url.trim());
    if name.is_empty() || url.is_empty() {
        return Err(format!("expected NAME=URL, got '{}'", value));
    }
    Ok(SourceSpec {
        name: name.to_string(),
        url: url.to_string(),
    })
}

/// Configuration for the inventory sync server.
#[derive(Parser, Debug, Clone)]
#[command(name = "inventory-sync-server")]
#[command(about = "Keeps an inventory cache in sync with its authoritative spreadsheets")]
pub struct Config {
    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "SYNC_HOST")]
    pub host: String,

    /// Port to bind to
    #[arg(long, default_value = "8080", env = "SYNC_PORT")]
    pub port: u16,

    /// Authoritative row service, as NAME=URL (repeatable)
    #[arg(long = "source", env = "SYNC_SOURCES", value_delimiter = ',', value_parser = parse_source)]
    pub sources: Vec<SourceSpec>,

    /// Bearer token sent to the row services
    #[arg(long, env = "ROW_SERVICE_TOKEN")]
    pub row_service_token: Option<String>,

    /// Serve two in-memory seeded sources instead of row services
    #[arg(long, env = "SYNC_DEMO")]
    pub demo: bool,

    /// Interval between polls of one source, in milliseconds
    #[arg(long, default_value = "5000", env = "SYNC_POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,

    /// Edit session lifetime, in seconds
    #[arg(long, default_value = "30", env = "SYNC_EDIT_TTL_SECS")]
    pub edit_ttl_secs: u64,

    /// Safety margin added to a retry-after, in milliseconds
    #[arg(long, default_value = "250", env = "SYNC_RETRY_MARGIN_MS")]
    pub retry_margin_ms: u64,

    /// Longest retry-after worth waiting for, in milliseconds; longer fails the mutation
    #[arg(long, default_value = "10000", env = "SYNC_MAX_RETRY_AFTER_MS")]
    pub max_retry_after_ms: u64,

    /// Deadline of a client mutation, in seconds
    #[arg(long, default_value = "30", env = "SYNC_MUTATION_DEADLINE_SECS")]
    pub mutation_deadline_secs: u64,

    /// Hard timeout of a delete suppression, in seconds
    #[arg(long, default_value = "30", env = "SYNC_SUPPRESSION_TIMEOUT_SECS")]
    pub suppression_timeout_secs: u64,

    /// How long a confirmed mutation is matched against poll echoes, in seconds
    #[arg(long, default_value = "60", env = "SYNC_ECHO_WINDOW_SECS")]
    pub echo_window_secs: u64,

    /// Buffered change events per observer
    #[arg(long, default_value = "256", env = "SYNC_BROADCAST_CAPACITY")]
    pub broadcast_capacity: usize,

    /// Items of one bulk run processed concurrently
    #[arg(long, default_value = "8", env = "SYNC_BULK_CONCURRENCY")]
    pub bulk_concurrency: usize,

    /// Deletions in one poll above which the shrink must be confirmed
    #[arg(long, default_value = "50", env = "SYNC_MASS_DELETE_THRESHOLD")]
    pub mass_delete_threshold: usize,

    /// Full refresh every N polls (0 = only the first)
    #[arg(long, default_value = "12", env = "SYNC_REFRESH_EVERY")]
    pub refresh_every: u64,
}

impl Config {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval_ms: self.poll_interval_ms,
            edit_ttl_secs: self.edit_ttl_secs,
            retry_margin_ms: self.retry_margin_ms,
            max_retry_after_ms: self.max_retry_after_ms,
            mutation_deadline_secs: self.mutation_deadline_secs,
            suppression_timeout_secs: self.suppression_timeout_secs,
            echo_window_secs: self.echo_window_secs,
            broadcast_capacity: self.broadcast_capacity,
            bulk_concurrency: self.bulk_concurrency,
            mass_delete_threshold: self.mass_delete_threshold,
            refresh_every: self.refresh_every,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source_spec() {
        let spec = parse_source("warehouse=http://rows:9000").unwrap();
        assert_eq!(spec.name, "warehouse");
        assert_eq!(spec.url, "http://rows:9000");

        assert!(parse_source("warehouse").is_err());
        assert!(parse_source("=http://rows").is_err());
    }

    #[test]
    fn test_engine_config_from_flags() {
        let config = Config::parse_from([
            "inventory-sync-server",
            "--demo",
            "--poll-interval-ms",
            "1000",
            "--edit-ttl-secs",
            "10",
        ]);
        assert!(config.demo);
        assert!(config.sources.is_empty());

        let engine = config.engine_config();
        assert_eq!(engine.poll_interval_ms, 1000);
        assert_eq!(engine.edit_ttl_secs, 10);
        assert_eq!(engine.bulk_concurrency, EngineConfig::default().bulk_concurrency);
    }

    #[test]
    fn test_repeated_sources() {
        let config = Config::parse_from([
            "inventory-sync-server",
            "--source",
            "warehouse=http://a",
            "--source",
            "shop=http://b",
        ]);
        let names: Vec<_> = config.sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["warehouse", "shop"]);
    }
}
