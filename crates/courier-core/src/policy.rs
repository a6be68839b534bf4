use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// How long a successfully sent correlation id stays in the pending set,
    /// waiting for the delivery status update to land.
    pub sent_grace_ms: u64,
    /// How long the shared transfer list lingers after its last holder
    /// releases it.
    pub transfer_hold_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            sent_grace_ms: 1000,
            transfer_hold_ms: 10_000,
        }
    }
}
