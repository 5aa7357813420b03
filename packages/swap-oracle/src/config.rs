//! Oracle configuration.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use eyre::{eyre, Result};
use url::Url;

use crate::verifier::ConfirmationTable;

/// Oracle configuration, loaded from the environment.
///
/// NOTE: `Debug` is manually implemented to redact the signer keys.
/// Do NOT re-add `#[derive(Debug)]`.
#[derive(Clone)]
pub struct Config {
    /// Unique oracle instance ID for log correlation.
    pub oracle_id: String,

    /// Asset chain JSON-RPC endpoint.
    pub asset_rpc_url: String,
    /// Payment chain JSON-RPC endpoint.
    pub payment_rpc_url: String,
    /// Escrow contract on the Asset chain.
    pub asset_contract_address: String,
    /// Escrow contract on the Payment chain.
    pub payment_contract_address: String,
    /// Private key for oracle callbacks on the Asset chain.
    pub asset_signer_key: String,
    /// Private key for oracle callbacks on the Payment chain.
    pub payment_signer_key: String,

    /// Cadence of each event pump.
    pub event_poll_interval: Duration,
    /// Cadence of the timeout sweeper.
    pub sweep_interval: Duration,
    /// Fixed gas limit per oracle callback; the contracts' callbacks are
    /// simple state updates.
    pub callback_gas_limit: u64,
    /// Submitter retry cap for transient failures.
    pub submit_max_retries: u32,
    /// Value-to-confirmations table for the payment verifier.
    pub verifier_confirmation_table: ConfirmationTable,

    /// Status HTTP server port.
    pub server_port: u16,
    /// Status server bind address (default 127.0.0.1; use 0.0.0.0 to
    /// expose on all interfaces).
    pub server_bind_address: String,
    /// Directory for the per-run log file.
    pub log_dir: PathBuf,
    /// Serve the run log over `/logs`; off unless explicitly enabled.
    pub expose_logs: bool,
    /// Optional bearer token gating `/logs`.
    pub status_api_token: Option<String>,
    /// Status API rate limit.
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("oracle_id", &self.oracle_id)
            .field("asset_rpc_url", &self.asset_rpc_url)
            .field("payment_rpc_url", &self.payment_rpc_url)
            .field("asset_contract_address", &self.asset_contract_address)
            .field("payment_contract_address", &self.payment_contract_address)
            .field("asset_signer_key", &"<redacted>")
            .field("payment_signer_key", &"<redacted>")
            .field("event_poll_interval", &self.event_poll_interval)
            .field("sweep_interval", &self.sweep_interval)
            .field("callback_gas_limit", &self.callback_gas_limit)
            .field("submit_max_retries", &self.submit_max_retries)
            .field("server_port", &self.server_port)
            .field("server_bind_address", &self.server_bind_address)
            .field("log_dir", &self.log_dir)
            .field("expose_logs", &self.expose_logs)
            .field(
                "status_api_token",
                &self.status_api_token.as_ref().map(|_| "<redacted>"),
            )
            .field("rate_limit_per_second", &self.rate_limit_per_second)
            .field("rate_limit_burst_size", &self.rate_limit_burst_size)
            .finish()
    }
}

/// RPC endpoints must be http(s) URLs with a host; anything else is a
/// misconfiguration worth failing on at startup rather than at first poll.
fn check_rpc_endpoint(name: &str, raw: &str) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| eyre!("{name} is not a parseable URL: {e}"))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(eyre!(
                "{name} has unsupported scheme {other:?}, expected http or https"
            ))
        }
    }

    if url.host_str().is_none() {
        return Err(eyre!("{name} has no host in its URL"));
    }

    if url.scheme() == "http" {
        tracing::warn!(
            endpoint = name,
            "RPC endpoint is plain http; prefer https outside local devnets"
        );
    }

    Ok(())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded .env from {:?}", path);
        }

        let default_id = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| format!("oracle-{}", std::process::id()));

        let asset_rpc_url =
            env::var("ASSET_RPC_URL").map_err(|_| eyre!("ASSET_RPC_URL required"))?;
        check_rpc_endpoint("ASSET_RPC_URL", &asset_rpc_url)?;

        let payment_rpc_url =
            env::var("PAYMENT_RPC_URL").map_err(|_| eyre!("PAYMENT_RPC_URL required"))?;
        check_rpc_endpoint("PAYMENT_RPC_URL", &payment_rpc_url)?;

        let server_bind_address =
            env::var("SERVER_BIND_ADDRESS").unwrap_or_else(|_| "127.0.0.1".to_string());

        if server_bind_address != "127.0.0.1" && server_bind_address != "::1" {
            tracing::warn!(
                server_bind_address = %server_bind_address,
                "SERVER_BIND_ADDRESS is set to a non-localhost address — the status \
                 endpoints will be accessible from the network. Use firewall rules or a \
                 reverse proxy to restrict access in production."
            );
        }

        let verifier_confirmation_table = match env::var("VERIFIER_CONFIRMATION_TABLE") {
            Ok(spec) => ConfirmationTable::parse(&spec).ok_or_else(|| {
                eyre!("VERIFIER_CONFIRMATION_TABLE must be \"<wei>:<confs>,...\"")
            })?,
            Err(_) => ConfirmationTable::default(),
        };

        Ok(Self {
            oracle_id: env::var("ORACLE_ID").unwrap_or(default_id),

            asset_rpc_url,
            payment_rpc_url,
            asset_contract_address: env::var("ASSET_CONTRACT_ADDRESS")
                .map_err(|_| eyre!("ASSET_CONTRACT_ADDRESS required"))?,
            payment_contract_address: env::var("PAYMENT_CONTRACT_ADDRESS")
                .map_err(|_| eyre!("PAYMENT_CONTRACT_ADDRESS required"))?,
            asset_signer_key: env::var("ASSET_SIGNER_KEY")
                .map_err(|_| eyre!("ASSET_SIGNER_KEY required"))?,
            payment_signer_key: env::var("PAYMENT_SIGNER_KEY")
                .map_err(|_| eyre!("PAYMENT_SIGNER_KEY required"))?,

            event_poll_interval: Duration::from_secs(env_parsed("EVENT_POLL_INTERVAL_SECS", 15)),
            sweep_interval: Duration::from_secs(env_parsed("SWEEP_INTERVAL_SECS", 30)),
            callback_gas_limit: env_parsed("CALLBACK_GAS_LIMIT", 200_000),
            submit_max_retries: env_parsed("SUBMIT_MAX_RETRIES", 3),
            verifier_confirmation_table,

            // Default 9092 avoids the common devnet ports (8545/8546) and
            // leaves room for a second oracle instance.
            server_port: env_parsed("SERVER_PORT", 9092),
            server_bind_address,
            log_dir: PathBuf::from(env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string())),
            expose_logs: env::var("EXPOSE_LOGS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            status_api_token: env::var("STATUS_API_TOKEN").ok().filter(|t| !t.is_empty()),
            rate_limit_per_second: env_parsed("RATE_LIMIT_PER_SECOND", 10),
            rate_limit_burst_size: env_parsed("RATE_LIMIT_BURST_SIZE", 30),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{check_rpc_endpoint, Config};
    use serial_test::serial;

    const REQUIRED: [(&str, &str); 6] = [
        ("ASSET_RPC_URL", "http://localhost:8545"),
        ("PAYMENT_RPC_URL", "http://localhost:8546"),
        (
            "ASSET_CONTRACT_ADDRESS",
            "0x0000000000000000000000000000000000000001",
        ),
        (
            "PAYMENT_CONTRACT_ADDRESS",
            "0x0000000000000000000000000000000000000002",
        ),
        (
            "ASSET_SIGNER_KEY",
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        ),
        (
            "PAYMENT_SIGNER_KEY",
            "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
        ),
    ];

    fn set_required() {
        for (k, v) in &REQUIRED {
            std::env::set_var(k, v);
        }
    }

    fn clear_required() {
        for (k, _) in &REQUIRED {
            std::env::remove_var(k);
        }
    }

    #[test]
    #[serial]
    fn loads_with_defaults() {
        set_required();
        let config = Config::load().expect("Config should load with test env");
        assert_eq!(config.event_poll_interval.as_secs(), 15);
        assert_eq!(config.sweep_interval.as_secs(), 30);
        assert_eq!(config.callback_gas_limit, 200_000);
        assert_eq!(config.submit_max_retries, 3);
        assert_eq!(config.server_port, 9092);
        assert!(!config.expose_logs);
        assert!(config.status_api_token.is_none());
        clear_required();
    }

    #[test]
    #[serial]
    fn overrides_from_env() {
        set_required();
        std::env::set_var("EVENT_POLL_INTERVAL_SECS", "5");
        std::env::set_var("SWEEP_INTERVAL_SECS", "10");
        std::env::set_var("CALLBACK_GAS_LIMIT", "300000");
        std::env::set_var("SUBMIT_MAX_RETRIES", "5");
        std::env::set_var("EXPOSE_LOGS", "true");
        std::env::set_var("STATUS_API_TOKEN", "sekrit");

        let config = Config::load().expect("Config should load");
        assert_eq!(config.event_poll_interval.as_secs(), 5);
        assert_eq!(config.sweep_interval.as_secs(), 10);
        assert_eq!(config.callback_gas_limit, 300_000);
        assert_eq!(config.submit_max_retries, 5);
        assert!(config.expose_logs);
        assert_eq!(config.status_api_token.as_deref(), Some("sekrit"));

        for k in [
            "EVENT_POLL_INTERVAL_SECS",
            "SWEEP_INTERVAL_SECS",
            "CALLBACK_GAS_LIMIT",
            "SUBMIT_MAX_RETRIES",
            "EXPOSE_LOGS",
            "STATUS_API_TOKEN",
        ] {
            std::env::remove_var(k);
        }
        clear_required();
    }

    #[test]
    #[serial]
    fn missing_required_var_fails() {
        clear_required();
        std::env::remove_var("ASSET_RPC_URL");
        let err = Config::load().unwrap_err();
        assert!(err.to_string().contains("ASSET_RPC_URL"));
    }

    #[test]
    #[serial]
    fn debug_redacts_signer_keys() {
        set_required();
        let config = Config::load().unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("ac0974bec39a17e36ba4a6b4d238ff944bacb478"));
        clear_required();
    }

    #[test]
    fn endpoint_check_accepts_http_and_https() {
        assert!(check_rpc_endpoint("TEST", "http://localhost:8545").is_ok());
        assert!(check_rpc_endpoint("TEST", "https://rpc.example.com").is_ok());
    }

    #[test]
    fn endpoint_check_rejects_other_schemes() {
        let err = check_rpc_endpoint("TEST", "file:///etc/passwd").unwrap_err();
        assert!(err.to_string().contains("expected http or https"));
        let err = check_rpc_endpoint("TEST", "ftp://example.com").unwrap_err();
        assert!(err.to_string().contains("expected http or https"));
    }

    #[test]
    fn endpoint_check_rejects_malformed() {
        let err = check_rpc_endpoint("TEST", "not-a-url").unwrap_err();
        assert!(err.to_string().contains("parseable"));
        // the url crate may reject this at parse time (empty host) or our
        // own host check catches it; either way the host is the complaint
        let err = check_rpc_endpoint("TEST", "http://").unwrap_err();
        assert!(err.to_string().contains("host"));
    }
}
