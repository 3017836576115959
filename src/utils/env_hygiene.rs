/// Environment hygiene
/// The program sees an allow-listed environment only: passthrough names copied
/// from the host when present, a deterministic base set, and configured fixed
/// values. Loader variables never get through.
use crate::config::config::EnvironmentConfig;
use std::collections::BTreeMap;
use std::path::Path;

/// Variables the dynamic loader honors; always dropped
pub fn is_loader_variable(name: &str) -> bool {
    name.starts_with("LD_")
}

/// Environment hygiene manager
pub struct EnvHygiene {
    policy: EnvironmentConfig,
}

impl EnvHygiene {
    pub fn new(policy: EnvironmentConfig) -> Self {
        EnvHygiene { policy }
    }

    /// Build the child environment for a run rooted at `scratch`.
    pub fn sanitize_environment(&self, scratch: &Path) -> BTreeMap<String, String> {
        self.build(scratch, |name| std::env::var(name).ok())
    }

    fn build(
        &self,
        scratch: &Path,
        host: impl Fn(&str) -> Option<String>,
    ) -> BTreeMap<String, String> {
        let mut env_map = BTreeMap::new();

        for name in &self.policy.passthrough {
            if is_loader_variable(name) {
                log::warn!("Refusing to pass through loader variable {}", name);
                continue;
            }
            if let Some(value) = host(name) {
                env_map.insert(name.clone(), value);
            }
        }

        let scratch = scratch.to_string_lossy().into_owned();
        env_map.insert("PATH".to_string(), self.policy.path.clone());
        env_map.insert("HOME".to_string(), scratch.clone());
        env_map.insert("TMPDIR".to_string(), scratch);
        env_map.insert("LANG".to_string(), "C.UTF-8".to_string());

        for (name, value) in &self.policy.fixed {
            if is_loader_variable(name) {
                log::warn!("Dropping fixed loader variable {}", name);
                continue;
            }
            env_map.insert(name.clone(), value.clone());
        }

        env_map
    }
}
