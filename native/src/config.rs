// Runtime configuration read from the environment (and `.env` in binaries).

use log::debug;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};
use crate::ipc::pipe::DEFAULT_MAX_MESSAGE_SIZE;

pub const RPC_TIMEOUT_ENV: &str = "OVERLAY_RPC_TIMEOUT_MS";
pub const ACK_TIMEOUT_ENV: &str = "OVERLAY_ACK_TIMEOUT_MS";
pub const HANDSHAKE_TIMEOUT_ENV: &str = "OVERLAY_HANDSHAKE_TIMEOUT_MS";
pub const MAX_MESSAGE_BYTES_ENV: &str = "OVERLAY_MAX_MESSAGE_BYTES";
pub const TARGET_PROGRAM_ENV: &str = "OVERLAY_TARGET_PROGRAM";
pub const TARGET_ARGS_ENV: &str = "OVERLAY_TARGET_ARGS";

const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Deadlines are `None` when configured as 0 (wait forever).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub call_timeout: Option<Duration>,
    pub ack_timeout: Option<Duration>,
    pub handshake_timeout: Option<Duration>,
    pub max_message_size: usize,
    pub target_program: Option<PathBuf>,
    pub target_args: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS)),
            ack_timeout: Some(Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS)),
            handshake_timeout: Some(Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS)),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            target_program: None,
            target_args: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> BridgeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> BridgeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(RPC_TIMEOUT_ENV) {
            config.call_timeout = parse_timeout(RPC_TIMEOUT_ENV, &raw)?;
        }
        if let Some(raw) = lookup(ACK_TIMEOUT_ENV) {
            config.ack_timeout = parse_timeout(ACK_TIMEOUT_ENV, &raw)?;
        }
        if let Some(raw) = lookup(HANDSHAKE_TIMEOUT_ENV) {
            config.handshake_timeout = parse_timeout(HANDSHAKE_TIMEOUT_ENV, &raw)?;
        }
        if let Some(raw) = lookup(MAX_MESSAGE_BYTES_ENV) {
            let bytes: usize = parse_number(MAX_MESSAGE_BYTES_ENV, &raw)?;
            if bytes == 0 || bytes > u32::MAX as usize {
                return Err(BridgeError::Config(format!(
                    "{} must be between 1 and {}",
                    MAX_MESSAGE_BYTES_ENV,
                    u32::MAX
                )));
            }
            config.max_message_size = bytes;
        }

        config.target_program = lookup(TARGET_PROGRAM_ENV)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from);
        if let Some(raw) = lookup(TARGET_ARGS_ENV) {
            config.target_args = raw.split_whitespace().map(str::to_string).collect();
        }

        debug!("[CONFIG] Loaded {:?}", config);
        Ok(config)
    }

    /// The program the host launches, required by the host binary.
    pub fn require_target_program(&self) -> BridgeResult<&PathBuf> {
        self.target_program
            .as_ref()
            .ok_or_else(|| BridgeError::Config(format!("{} is not set", TARGET_PROGRAM_ENV)))
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> BridgeResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| BridgeError::Config(format!("{} = {:?} is not a valid number", name, raw)))
}

fn parse_timeout(name: &str, raw: &str) -> BridgeResult<Option<Duration>> {
    let millis: u64 = parse_number(name, raw)?;
    Ok((millis > 0).then(|| Duration::from_millis(millis)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> BridgeResult<BridgeConfig> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        BridgeConfig::from_lookup(|key| map.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.call_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert!(config.require_target_program().is_err());
    }

    #[test]
    fn test_overrides_and_zero_timeout() {
        let config = config_from(&[
            (RPC_TIMEOUT_ENV, "0"),
            (ACK_TIMEOUT_ENV, "250"),
            (MAX_MESSAGE_BYTES_ENV, "4096"),
            (TARGET_PROGRAM_ENV, "/usr/bin/game"),
            (TARGET_ARGS_ENV, "  --windowed   -novid "),
        ])
        .unwrap();

        assert_eq!(config.call_timeout, None);
        assert_eq!(config.ack_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.require_target_program().unwrap(), &PathBuf::from("/usr/bin/game"));
        assert_eq!(config.target_args, vec!["--windowed", "-novid"]);
    }

    #[test]
    fn test_malformed_values_are_config_errors() {
        for pairs in [
            [(RPC_TIMEOUT_ENV, "soon")],
            [(HANDSHAKE_TIMEOUT_ENV, "-1")],
            [(MAX_MESSAGE_BYTES_ENV, "0")],
        ] {
            assert!(matches!(config_from(&pairs), Err(BridgeError::Config(_))));
        }
    }
}
