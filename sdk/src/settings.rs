//! Best-effort remote sync of generation settings.
//!
//! Local persistence (settings.json under the data dir) is owned by the
//! runtime; this module only mirrors changed defaults to the gateway so a
//! device fleet can be inspected centrally. Sync is strictly best effort:
//! failures are logged and never block or fail local operation.

use lumen_core::config::CloudConfig;
use lumen_core::options::GenerationDefaults;
use std::time::Duration;

const SYNC_TIMEOUT_MS: u64 = 5_000;

/// Pushes settings changes to the gateway, when sync is enabled and the
/// gateway is reachable.
#[derive(Clone)]
pub struct SettingsSync {
    endpoint: Option<String>,
    api_key: Option<String>,
    agent: ureq::Agent,
}

impl SettingsSync {
    pub fn new(cloud: &CloudConfig, enabled: bool) -> Self {
        let endpoint = enabled.then(|| {
            format!("{}/sdk/settings", cloud.gateway_url.trim_end_matches('/'))
        });
        Self {
            endpoint,
            api_key: cloud.resolve_api_key(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_millis(SYNC_TIMEOUT_MS))
                .build(),
        }
    }

    /// Whether pushes go anywhere at all.
    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Mirror the defaults to the gateway. Blocking; callers run this on
    /// the blocking pool and ignore the outcome beyond logs.
    pub fn push(&self, defaults: &GenerationDefaults) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        let mut request = self.agent.put(endpoint).set("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {}", key));
        }
        match request.send_json(defaults) {
            Ok(_) => log::debug!("settings synced to {}", endpoint),
            Err(e) => log::warn!("settings sync failed (local state kept): {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sync_has_no_endpoint() {
        let sync = SettingsSync::new(&CloudConfig::default(), false);
        assert!(!sync.is_enabled());
        // A push with no endpoint is a no-op, not an error.
        sync.push(&GenerationDefaults::default());
    }

    #[test]
    fn endpoint_derives_from_the_gateway_url() {
        let cloud = CloudConfig {
            gateway_url: "https://gw.example/v1/".into(),
            ..Default::default()
        };
        let sync = SettingsSync::new(&cloud, true);
        assert!(sync.is_enabled());
        assert_eq!(
            sync.endpoint.as_deref(),
            Some("https://gw.example/v1/sdk/settings")
        );
    }
}
