pub mod retry;

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use tracing::info;

use crate::models::common::Config;

const ENV_PREFIX: &str = "EVENT_MESH";

pub fn load_config<P: AsRef<Path>>(file_name: P) -> Result<Config> {
    let config_path = file_name.as_ref();
    info!("Config path: {}", config_path.to_string_lossy());

    // File first, then EVENT_MESH__SECTION__KEY overrides from the environment
    let config = config::Config::builder()
        .add_source(config::File::from(config_path))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .context("failed to read config file")?;

    let mut config: Config = config
        .try_deserialize()
        .context("failed to parse config YAML")?;

    // Domain names become store path segments
    config.domains = config
        .domains
        .into_iter()
        .map(|(name, domain)| (name.to_lowercase(), domain))
        .collect();

    Ok(config)
}

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

fn strip_html(error: &str) -> String {
    // If the error contains HTML tags, extract just the text content
    if error.contains("<!doctype html>") || error.contains("<html>") {
        error
            .lines()
            .map(|line| line.trim())
            .find(|line| {
                !line.starts_with('<')
                    && !line.ends_with('>')
                    && !line.is_empty()
                    && *line != "html"
                    && *line != "body"
            })
            .unwrap_or(error)
            .to_string()
    } else {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_reads_domains_and_lowercases_names() -> Result<()> {
        let path = std::env::temp_dir().join(format!("event-mesh-config-{}.yml", uuid::Uuid::new_v4().simple()));
        std::fs::write(
            &path,
            r#"
chain_id: 1
siwe: { domain: "indexer.example.org", uri: "https://indexer.example.org" }
wallet: { private_key: "0x01" }
nonce: { ttl_secs: 60 }
store: { peers: 2 }
state_dir: "./state"
poll_interval_ms: 1000
batch_size: 100
retry_queue_capacity: 10
metrics: { enabled: false, address: "0.0.0.0", port: 9100 }
domains:
  Acme:
    rpcUrl: "http://localhost:8545"
    contractAddress: "0x00000000000000000000000000000000000000aa"
    contractAbi: []
    startBlock: 5
"#,
        )?;

        let config = load_config(&path)?;
        std::fs::remove_file(&path)?;

        let acme = config.domains.get("acme").expect("domain lowercased");
        assert_eq!(acme.start_block, Some(5));
        assert_eq!(acme.rpc_url, "http://localhost:8545");
        assert!(config.readers.is_empty());
        assert!(config.report_url.is_none());
        Ok(())
    }

    #[test]
    fn strip_html_keeps_plain_errors() {
        assert_eq!(strip_html("connection refused"), "connection refused");
    }

    #[test]
    fn strip_html_extracts_gateway_text() {
        let page = "<html>\n<body>\n502 Bad Gateway\n</body>\n</html>";
        assert_eq!(strip_html(page), "502 Bad Gateway");
    }
}
