//! Resolver configuration
//!
//! Loaded from TOML with kebab-case keys. Durations use humantime syntax
//! (`"20s"`, `"250ms"`). Everything is validated before the resolver
//! processes its first membership event.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::executor::RetryPolicy;
use crate::cluster::role::RoleFilter;
use crate::cluster::strategy::DowningStrategy;
use crate::error::{ResolverError, ResolverResult};
use crate::types::NodeAddress;

/// Strategy selected by `active-strategy`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyName {
    StaticQuorum,
    KeepMajority,
    KeepReferee,
    #[serde(alias = "keep-oldest-member")]
    KeepOldest,
}

impl Default for StrategyName {
    fn default() -> Self {
        StrategyName::KeepMajority
    }
}

/// Top-level split-brain resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SplitBrainConfig {
    /// Strategy used to pick the surviving side
    pub active_strategy: StrategyName,
    /// Quiet period required before a decision is taken
    #[serde(with = "humantime_serde")]
    pub stable_after: Duration,
    /// Extra instability budget after which everyone is downed; absent disables it
    #[serde(with = "humantime_serde")]
    pub down_all_when_unstable: Option<Duration>,
    /// Restricts sizing and downing to nodes carrying this role
    pub role: Option<String>,
    /// Shorthand for `keep-oldest.down-if-alone`; wins when both are set
    pub down_if_alone: Option<bool>,
    pub static_quorum: StaticQuorumConfig,
    pub keep_referee: KeepRefereeConfig,
    pub keep_oldest: KeepOldestConfig,
    /// Down-command retry settings
    pub downing: DowningConfig,
}

impl Default for SplitBrainConfig {
    fn default() -> Self {
        Self {
            active_strategy: StrategyName::default(),
            stable_after: Duration::from_secs(20),
            down_all_when_unstable: None,
            role: None,
            down_if_alone: None,
            static_quorum: StaticQuorumConfig::default(),
            keep_referee: KeepRefereeConfig::default(),
            keep_oldest: KeepOldestConfig::default(),
            downing: DowningConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StaticQuorumConfig {
    /// Minimum number of members a side needs to survive
    pub min_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct KeepRefereeConfig {
    /// Address of the referee node
    pub address: Option<String>,
    /// The referee side downs itself when it has fewer members than this
    pub down_all_if_less_than_nodes: usize,
}

impl Default for KeepRefereeConfig {
    fn default() -> Self {
        Self {
            address: None,
            down_all_if_less_than_nodes: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct KeepOldestConfig {
    /// Down the oldest member when it is alone on its side
    pub down_if_alone: bool,
}

impl Default for KeepOldestConfig {
    fn default() -> Self {
        Self { down_if_alone: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DowningConfig {
    /// Attempts per down-command before the decision is reported as failed
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for DowningConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl SplitBrainConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> ResolverResult<Self> {
        let config: SplitBrainConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> ResolverResult<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    /// Fail fast on anything that would leave a strategy undefined
    pub fn validate(&self) -> ResolverResult<()> {
        if self.stable_after.is_zero() {
            return Err(invalid("stable-after must be greater than zero"));
        }
        if let Some(role) = &self.role {
            if role.trim().is_empty() {
                return Err(invalid("role must not be empty"));
            }
        }
        if self.downing.max_attempts == 0 {
            return Err(invalid("downing.max-attempts must be at least 1"));
        }
        if self.downing.initial_backoff > self.downing.max_backoff {
            return Err(invalid("downing.initial-backoff must not exceed downing.max-backoff"));
        }
        self.strategy().map(|_| ())
    }

    /// Build the configured strategy with its parameters
    pub fn strategy(&self) -> ResolverResult<DowningStrategy> {
        match self.active_strategy {
            StrategyName::StaticQuorum => {
                let min_size = self.static_quorum.min_size;
                if min_size == 0 {
                    return Err(invalid("static-quorum.min-size must be at least 1"));
                }
                Ok(DowningStrategy::StaticQuorum { min_size })
            }
            StrategyName::KeepMajority => Ok(DowningStrategy::KeepMajority),
            StrategyName::KeepReferee => {
                let address = self
                    .keep_referee
                    .address
                    .as_deref()
                    .filter(|a| !a.trim().is_empty())
                    .ok_or_else(|| invalid("keep-referee.address is required"))?;
                let referee = NodeAddress::new(address)?;
                let down_all_if_less_than_nodes = self.keep_referee.down_all_if_less_than_nodes;
                if down_all_if_less_than_nodes == 0 {
                    return Err(invalid("keep-referee.down-all-if-less-than-nodes must be at least 1"));
                }
                Ok(DowningStrategy::KeepReferee {
                    referee,
                    down_all_if_less_than_nodes,
                })
            }
            StrategyName::KeepOldest => Ok(DowningStrategy::KeepOldest {
                down_if_alone: self.down_if_alone.unwrap_or(self.keep_oldest.down_if_alone),
            }),
        }
    }

    pub fn role_filter(&self) -> RoleFilter {
        RoleFilter::new(self.role.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.downing.max_attempts,
            initial_backoff: self.downing.initial_backoff,
            max_backoff: self.downing.max_backoff,
        }
    }
}

fn invalid(message: &str) -> ResolverError {
    ResolverError::ConfigurationInvalid(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SplitBrainConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strategy().unwrap(), DowningStrategy::KeepMajority);
        assert_eq!(config.stable_after, Duration::from_secs(20));
    }

    #[test]
    fn test_full_document() {
        let config = SplitBrainConfig::from_toml_str(
            r#"
            active-strategy = "keep-referee"
            stable-after = "30s"
            down-all-when-unstable = "15s"
            role = "backend"

            [keep-referee]
            address = "10.0.0.4:2552"
            down-all-if-less-than-nodes = 2

            [downing]
            max-attempts = 3
            initial-backoff = "100ms"
            max-backoff = "1s"
            "#,
        )
        .unwrap();

        assert_eq!(config.stable_after, Duration::from_secs(30));
        assert_eq!(config.down_all_when_unstable, Some(Duration::from_secs(15)));
        assert_eq!(config.role.as_deref(), Some("backend"));
        assert_eq!(
            config.strategy().unwrap(),
            DowningStrategy::KeepReferee {
                referee: "10.0.0.4:2552".parse().unwrap(),
                down_all_if_less_than_nodes: 2,
            }
        );
        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_backoff, Duration::from_millis(100));
    }

    #[test]
    fn test_keep_referee_requires_address() {
        let err = SplitBrainConfig::from_toml_str(r#"active-strategy = "keep-referee""#).unwrap_err();
        assert!(matches!(err, ResolverError::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_static_quorum_requires_min_size() {
        let err = SplitBrainConfig::from_toml_str(r#"active-strategy = "static-quorum""#).unwrap_err();
        assert!(matches!(err, ResolverError::ConfigurationInvalid(_)));

        let config = SplitBrainConfig::from_toml_str(
            r#"
            active-strategy = "static-quorum"
            [static-quorum]
            min-size = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.strategy().unwrap(), DowningStrategy::StaticQuorum { min_size: 3 });
    }

    #[test]
    fn test_top_level_down_if_alone_overrides() {
        let config = SplitBrainConfig::from_toml_str(
            r#"
            active-strategy = "keep-oldest"
            down-if-alone = false
            [keep-oldest]
            down-if-alone = true
            "#,
        )
        .unwrap();
        assert_eq!(config.strategy().unwrap(), DowningStrategy::KeepOldest { down_if_alone: false });
    }

    #[test]
    fn test_rejects_unknown_strategy_and_bad_durations() {
        assert!(SplitBrainConfig::from_toml_str(r#"active-strategy = "keep-everyone""#).is_err());
        assert!(SplitBrainConfig::from_toml_str(r#"stable-after = "0s""#).is_err());
        assert!(SplitBrainConfig::from_toml_str(
            r#"
            [downing]
            initial-backoff = "10s"
            max-backoff = "1s"
            "#
        )
        .is_err());
    }

    #[test]
    fn test_empty_role_rejected() {
        assert!(SplitBrainConfig::from_toml_str(r#"role = "  ""#).is_err());
    }
}
