//! Rate limit rules and resolution.
//!
//! Rules map a `(client_id, limit_key)` pair to the `(rate, window)` to
//! enforce. The active rule set is an immutable snapshot behind an atomic
//! pointer; updates build a new set and swap it, so resolution never blocks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LimiterError, Result};

/// A single `(rate, window)` limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Requests permitted per window
    pub rate: u64,
    /// Window length in seconds
    pub window: u64,
}

/// Per-client configuration: an optional top-level limit plus per-endpoint
/// overrides. Missing top-level fields fall back to the default rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientRules {
    #[serde(default)]
    pub rate: Option<u64>,
    #[serde(default)]
    pub window: Option<u64>,
    #[serde(default)]
    pub endpoints: HashMap<String, Rule>,
}

/// A complete rule set: the default rule and per-client entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub default: Rule,
    #[serde(default)]
    pub clients: HashMap<String, ClientRules>,
}

impl Default for RuleSet {
    /// Built-in rules used when no rules file is configured.
    fn default() -> Self {
        let mut clients = HashMap::new();
        clients.insert(
            "client_a".to_string(),
            ClientRules {
                rate: Some(100),
                window: Some(60),
                endpoints: HashMap::from([
                    ("login".to_string(), Rule { rate: 20, window: 60 }),
                    ("register".to_string(), Rule { rate: 10, window: 60 }),
                ]),
            },
        );
        clients.insert(
            "client_b".to_string(),
            ClientRules {
                rate: Some(50),
                window: Some(60),
                endpoints: HashMap::new(),
            },
        );
        Self {
            default: Rule {
                rate: 100,
                window: 60,
            },
            clients,
        }
    }
}

impl RuleSet {
    /// Load a rule set from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a rule set from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RuleSet = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("failed to parse rules: {e}")))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Every rate and window must be positive.
    pub fn validate(&self) -> Result<()> {
        let check = |scope: &str, rule: &Rule| {
            if rule.rate == 0 || rule.window == 0 {
                return Err(LimiterError::Config(format!(
                    "rule for {scope} must have positive rate and window"
                )));
            }
            Ok(())
        };
        check("default", &self.default)?;
        for (client_id, client) in &self.clients {
            if let (Some(rate), Some(window)) = (client.rate, client.window) {
                check(client_id, &Rule { rate, window })?;
            }
            for (endpoint, rule) in &client.endpoints {
                check(&format!("{client_id}:{endpoint}"), rule)?;
            }
        }
        Ok(())
    }
}

/// Resolves the effective rule for a check.
///
/// Holds the rule set behind an [`ArcSwap`]; readers get a consistent
/// snapshot without locking while updates swap in a new set.
pub struct RuleResolver {
    rules: ArcSwap<RuleSet>,
}

impl RuleResolver {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: ArcSwap::from_pointee(rules),
        }
    }

    /// Resolve `(client_id, limit_key)` to the rule to enforce.
    ///
    /// Precedence: the client's endpoint override, then the client's
    /// top-level rule (missing fields filled from the default), then the
    /// default rule.
    pub fn resolve(&self, client_id: &str, limit_key: &str) -> Rule {
        let rules = self.rules.load();
        if let Some(client) = rules.clients.get(client_id) {
            if let Some(rule) = client.endpoints.get(limit_key) {
                return *rule;
            }
            return Rule {
                rate: client.rate.unwrap_or(rules.default.rate),
                window: client.window.unwrap_or(rules.default.window),
            };
        }
        rules.default
    }

    /// The snapshot currently in use.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }

    /// Replace the entire rule set.
    pub fn replace(&self, rules: RuleSet) {
        self.rules.store(Arc::new(rules));
    }

    /// Update one client's rule, producing a new snapshot.
    ///
    /// With an `endpoint` the override for that endpoint is set; without one
    /// the client's top-level rule is set.
    pub fn upsert(&self, client_id: &str, endpoint: Option<&str>, rule: Rule) {
        self.rules.rcu(|current| {
            let mut next = RuleSet::clone(current);
            let client = next.clients.entry(client_id.to_string()).or_default();
            match endpoint {
                Some(endpoint) => {
                    client.endpoints.insert(endpoint.to_string(), rule);
                }
                None => {
                    client.rate = Some(rule.rate);
                    client.window = Some(rule.window);
                }
            }
            next
        });
    }
}

impl Default for RuleResolver {
    fn default() -> Self {
        Self::new(RuleSet::default())
    }
}
