//! Sidecar metadata.
//!
//! Each stage's cache directory is accompanied by a small JSON sidecar
//! recording what it needs to detect staleness on a later run: a random
//! identity for this execution, the verification token reported by
//! `Stage::verify`, the config values it depended on at the time, and the
//! identities of the upstream stages it read from. Grounded on the
//! source's `%s_config.yml`/uuid bookkeeping in `pipeline.py::run`; the
//! serde-backed round-trip follows the teacher's
//! `storage::config::ConfigData::serialize`/`deserialize`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::FlatConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidecar {
    /// Identity of this stage as of its last successful execution.
    pub uuid: Uuid,
    /// Token returned by `Stage::verify` at the time of last execution, or
    /// `None` if the stage has no verify hook (no separate version axis).
    pub verification_token: Option<String>,
    /// The declared config key/value pairs this stage last ran with.
    pub config: FlatConfig,
    /// Upstream stage name -> its `uuid` as observed at the time this
    /// stage last ran. Used to detect that an upstream has since
    /// re-executed (and so must be treated as changed even if nothing
    /// about this stage itself changed).
    pub expected_uuids: HashMap<String, Uuid>,
}

impl Sidecar {
    pub fn new(
        verification_token: Option<String>,
        config: FlatConfig,
        expected_uuids: HashMap<String, Uuid>,
    ) -> Self {
        Self { uuid: Uuid::new_v4(), verification_token, config, expected_uuids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json;

    #[test]
    fn sidecar_round_trips_through_json() {
        let mut expected = HashMap::new();
        expected.insert("upstream".to_string(), Uuid::new_v4());

        let sidecar = Sidecar::new(Some("v1".to_string()), FlatConfig::new(), expected);
        let text = serde_json::to_string(&sidecar).unwrap();
        let back: Sidecar = serde_json::from_str(&text).unwrap();

        assert_eq!(back.uuid, sidecar.uuid);
        assert_eq!(back.verification_token, sidecar.verification_token);
    }
}
