//! Node identity: load from the durable store or mint a fresh one on
//! first run. Identity failures are fatal to initialization.

use tracing::info;
use weft_store::MeshStore;

use crate::error::WeftError;
use crate::types::NodeId;

/// Load the persisted identity, creating one on first run. An explicit
/// `configured_name` overrides (and persists over) the stored name.
pub fn load_or_create(
    store: &MeshStore,
    configured_name: Option<&str>,
) -> Result<(NodeId, String), WeftError> {
    let stored = store
        .load_identity()
        .map_err(|e| WeftError::IdentityUnavailable(e.to_string()))?;

    match stored {
        Some((id, name)) => {
            let name = match configured_name {
                Some(configured) if configured != name => {
                    store
                        .set_device_name(configured)
                        .map_err(|e| WeftError::IdentityUnavailable(e.to_string()))?;
                    configured.to_string()
                }
                _ => name,
            };
            Ok((id, name))
        }
        None => {
            let id = NodeId::generate();
            let name = configured_name
                .map(str::to_string)
                .unwrap_or_else(|| format!("MeshUser-{}", id.as_str()));
            store
                .save_identity(&id, &name)
                .map_err(|e| WeftError::IdentityUnavailable(e.to_string()))?;
            info!("identity: created node {id} ({name})");
            Ok((id, name))
        }
    }
}
