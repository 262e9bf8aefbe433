//! Per-layer quota binding

use serde::{Deserialize, Serialize};

use super::value::Quota;

/// Allowed and used quota for one layer, plus the expiration policy that
/// enforces it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerQuota {
    /// Layer name
    pub layer: String,
    /// Expiration policy name; falls back to the global policy when unset
    #[serde(default)]
    pub expiration_policy_name: Option<String>,
    /// Allowed quota; `None` means the layer is not limited
    #[serde(default)]
    pub quota: Option<Quota>,
    /// Running used quota
    #[serde(default)]
    pub used_quota: Quota,
}

impl LayerQuota {
    pub fn new(layer: impl Into<String>, policy: impl Into<String>, quota: Quota) -> Self {
        Self {
            layer: layer.into(),
            expiration_policy_name: Some(policy.into()),
            quota: Some(quota),
            used_quota: Quota::zero(),
        }
    }

    /// Effective limit, unlimited when no quota is set
    pub fn limit(&self) -> Quota {
        self.quota.unwrap_or_else(Quota::unlimited)
    }

    /// Amount by which usage exceeds the limit; non-positive when within quota
    pub fn excess(&self) -> Quota {
        self.used_quota.difference(&self.limit())
    }
}

impl std::fmt::Display for LayerQuota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LayerQuota[layer={}, policy={}, quota={}, used={}]",
            self.layer,
            self.expiration_policy_name.as_deref().unwrap_or("<global>"),
            self.quota
                .map(|q| q.to_nice_string())
                .unwrap_or_else(|| "unlimited".to_string()),
            self.used_quota
        )
    }
}
