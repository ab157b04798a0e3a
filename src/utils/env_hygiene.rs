/// Environment hygiene for guest commands
///
/// Guest commands never inherit the host environment. Only an explicit
/// allow-list (the terminal type by default) passes through; the guest's own
/// login machinery supplies the rest.
use crate::config::loader::ENV_TERM;
use std::collections::BTreeMap;
use std::env;

/// Environment sanitization policy
#[derive(Debug, Clone)]
pub struct EnvPolicy {
    /// Variables copied from the caller when set
    pub preserve: Vec<String>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        EnvPolicy {
            preserve: vec![ENV_TERM.to_string()],
        }
    }
}

/// Environment hygiene manager
#[derive(Debug, Clone, Default)]
pub struct EnvHygiene {
    policy: EnvPolicy,
}

impl EnvHygiene {
    pub fn new(policy: EnvPolicy) -> Self {
        EnvHygiene { policy }
    }

    pub fn policy(&self) -> &EnvPolicy {
        &self.policy
    }

    /// Scrubbed environment built from the current process environment
    pub fn sanitize_environment(&self) -> BTreeMap<String, String> {
        self.sanitize_from(env::vars())
    }

    /// Scrubbed environment built from an arbitrary variable source
    pub fn sanitize_from<I>(&self, vars: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env_map = BTreeMap::new();
        let mut dropped = 0usize;

        for (key, value) in vars {
            if self.policy.preserve.iter().any(|k| *k == key) {
                env_map.insert(key, value);
            } else {
                dropped += 1;
            }
        }

        log::debug!(
            "Scrubbed environment: kept {:?}, dropped {} variables",
            env_map.keys().collect::<Vec<_>>(),
            dropped
        );
        env_map
    }
}
