// src/config.rs
use std::time::Duration;

use clap::Parser;
use ethers::types::{Address, U256};

use crate::backend::kernel::PermissionModules;
use crate::client::channel::{ChannelConfig, ReconnectPolicy};
use crate::error::DelegateError;
use crate::userop::entrypoint::ENTRY_POINT_V07;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Config {
    #[clap(long, env = "RPC_SERVER_ADDR", default_value = "127.0.0.1:8545")]
    pub rpc_server_addr: String,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[clap(short, long, env = "ETH_RPC_URL")]
    pub eth_rpc_url: String,

    #[clap(short, long, env = "CHAIN_ID")]
    pub chain_id: u64,

    #[clap(long, env = "ENTRY_POINT", default_value = ENTRY_POINT_V07)]
    pub entry_point: Address,

    #[clap(short, long, env = "KERNEL_ADDRESS")]
    pub kernel_address: Address,

    /// Defaults to the root key's address.
    #[clap(long, env = "OWNER_ADDRESS")]
    pub owner: Option<Address>,

    #[clap(long, env = "ROOT_KEY", hide_env_values = true)]
    pub root_key: String,

    /// Remote relay. Without it the relay runs in-process against `--bundler-url`.
    #[clap(long, env = "RELAY_URL")]
    pub relay_url: Option<String>,

    /// Defaults to the relay URL with its scheme switched to `ws`/`wss`.
    #[clap(long, env = "PROGRESS_URL")]
    pub progress_url: Option<String>,

    #[clap(long, env = "BUNDLER_URL")]
    pub bundler_url: Option<String>,

    #[clap(long, env = "PAYMASTER_URL")]
    pub paymaster_url: Option<String>,

    /// Where the in-process relay serves its progress channel.
    #[clap(long, env = "PROGRESS_ADDR", default_value = "127.0.0.1:8546")]
    pub progress_addr: String,

    #[clap(long, env = "ECDSA_SIGNER")]
    pub ecdsa_signer: Option<Address>,

    #[clap(long, env = "SUDO_POLICY")]
    pub sudo_policy: Option<Address>,

    #[clap(long, env = "CALL_POLICY")]
    pub call_policy: Option<Address>,

    #[clap(long, env = "HEARTBEAT_SECS", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub heartbeat_secs: u64,

    #[clap(long, env = "RECONNECT_BASE_MS", default_value_t = 1_000)]
    pub reconnect_base_ms: u64,

    #[clap(long, env = "RECONNECT_MAX_MS", default_value_t = 30_000)]
    pub reconnect_max_ms: u64,

    #[clap(long, env = "RECONNECT_MAX_ATTEMPTS", default_value_t = 5)]
    pub reconnect_max_attempts: u32,

    #[clap(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMode {
    Remote {
        url: String,
        timeout: Duration,
    },
    Embedded {
        bundler_url: String,
        paymaster_url: Option<String>,
        modules: PermissionModules,
    },
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    /// Every installation gets a progress socket: the configured one, the remote relay's own
    /// host, or the embedded hub.
    pub fn channel(&self) -> Result<ChannelConfig, DelegateError> {
        let url = match (&self.progress_url, &self.relay_url) {
            (Some(url), _) => url.clone(),
            (None, Some(relay_url)) => websocket_url(relay_url)?,
            (None, None) => format!("ws://{}/", self.progress_addr),
        };
        Ok(ChannelConfig {
            url,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            reconnect: self.reconnect_policy(),
        })
    }

    /// Compared as U256: a node may report a chain id wider than 64 bits.
    pub fn check_chain_id(&self, reported: U256) -> Result<(), DelegateError> {
        if reported != U256::from(self.chain_id) {
            return Err(DelegateError::InvalidRequest(format!(
                "RPC endpoint is on chain {}, expected {}",
                reported, self.chain_id
            )));
        }
        Ok(())
    }

    pub fn relay(&self) -> Result<RelayMode, DelegateError> {
        if let Some(url) = &self.relay_url {
            return Ok(RelayMode::Remote {
                url: url.clone(),
                timeout: self.request_timeout(),
            });
        }
        match (
            &self.bundler_url,
            self.ecdsa_signer,
            self.sudo_policy,
            self.call_policy,
        ) {
            (Some(bundler_url), Some(ecdsa_signer), Some(sudo_policy), Some(call_policy)) => {
                Ok(RelayMode::Embedded {
                    bundler_url: bundler_url.clone(),
                    paymaster_url: self.paymaster_url.clone(),
                    modules: PermissionModules {
                        ecdsa_signer,
                        sudo_policy,
                        call_policy,
                    },
                })
            }
            _ => Err(DelegateError::InvalidRequest(
                "set --relay-url, or --bundler-url with --ecdsa-signer, --sudo-policy and --call-policy"
                    .to_string(),
            )),
        }
    }
}

fn websocket_url(http_url: &str) -> Result<String, DelegateError> {
    let (scheme, rest) = http_url.split_once("://").ok_or_else(|| {
        DelegateError::InvalidRequest(format!("relay URL {http_url} has no scheme"))
    })?;
    let scheme = match scheme {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(DelegateError::InvalidRequest(format!(
                "cannot derive a progress URL from scheme {other}"
            )))
        }
    };
    Ok(format!("{}://{}/", scheme, rest.trim_end_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: [&str; 9] = [
        "kernel-delegate",
        "--eth-rpc-url",
        "http://localhost:8545",
        "--chain-id",
        "1",
        "--kernel-address",
        "0x1111111111111111111111111111111111111111",
        "--root-key",
        "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
    ];

    fn parse(extra: &[&str]) -> Config {
        Config::try_parse_from(BASE.iter().chain(extra.iter())).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&["--relay-url", "https://relay.example"]);
        assert_eq!(config.entry_point, ENTRY_POINT_V07.parse::<Address>().unwrap());
        assert_eq!(config.rpc_server_addr, "127.0.0.1:8545");
        let policy = config.reconnect_policy();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(config.channel().unwrap().url, "wss://relay.example/");
        assert_eq!(
            config.relay().unwrap(),
            RelayMode::Remote {
                url: "https://relay.example".to_string(),
                timeout: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn embedded_relay_needs_modules() {
        let config = parse(&["--bundler-url", "http://localhost:4337"]);
        assert!(matches!(config.relay(), Err(DelegateError::InvalidRequest(_))));

        let config = parse(&[
            "--bundler-url",
            "http://localhost:4337",
            "--ecdsa-signer",
            "0xe1e1e1e1e1e1e1e1e1e1e1e1e1e1e1e1e1e1e1e1",
            "--sudo-policy",
            "0x5d5d5d5d5d5d5d5d5d5d5d5d5d5d5d5d5d5d5d5d",
            "--call-policy",
            "0xc0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0",
        ]);
        assert!(matches!(config.relay(), Ok(RelayMode::Embedded { .. })));
        assert_eq!(config.channel().unwrap().url, "ws://127.0.0.1:8546/");
    }

    #[test]
    fn remote_relay_progress_url() {
        let config = parse(&["--relay-url", "http://localhost:3000/"]);
        assert_eq!(config.channel().unwrap().url, "ws://localhost:3000/");

        let config = parse(&[
            "--relay-url",
            "https://relay.example",
            "--progress-url",
            "wss://progress.example/socket",
        ]);
        assert_eq!(config.channel().unwrap().url, "wss://progress.example/socket");

        let config = parse(&["--relay-url", "relay.example"]);
        assert!(matches!(config.channel(), Err(DelegateError::InvalidRequest(_))));
    }

    #[test]
    fn chain_id_is_compared_without_truncation() {
        let config = parse(&["--relay-url", "https://relay.example"]);
        assert!(config.check_chain_id(U256::from(1)).is_ok());
        assert!(config.check_chain_id(U256::from(5)).is_err());
        let wide = U256::from(u64::MAX) + U256::from(2);
        assert!(matches!(
            config.check_chain_id(wide),
            Err(DelegateError::InvalidRequest(_))
        ));
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        let zero = ["--heartbeat-secs", "0"];
        assert!(Config::try_parse_from(BASE.iter().chain(zero.iter())).is_err());
        assert_eq!(parse(&["--heartbeat-secs", "5"]).heartbeat_secs, 5);
    }
}
