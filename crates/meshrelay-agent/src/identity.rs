// ============================================
// File: crates/meshrelay-agent/src/identity.rs
// ============================================
//! # Agent Identity Persistence
//!
//! ## Creation Reason
//! An agent keeps its `AgentId` across restarts so neighbors and
//! advertised routes refer to the same agent.
//!
//! ## Main Functionality
//! - `load_or_create`: read the identity file, or generate and write one
//! - `load`: read only, for the `id` CLI command
//!
//! ## File Format
//! ```json
//! {
//!   "version": 1,
//!   "agent_id": "8f0c...32 hex chars",
//!   "created_at": "1760000000Z"
//! }
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The file is written with mode 0600 on Unix
//! - A corrupt file is an error, never silently replaced
//!
//! ## Last Modified
//! v0.1.0 - Initial identity persistence

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use meshrelay_common::time::Timestamp;
use meshrelay_common::AgentId;

use crate::error::{AgentError, Result};

/// Current identity file version.
const IDENTITY_FILE_VERSION: u32 = 1;

/// On-disk identity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityFile {
    version: u32,
    agent_id: AgentId,
    created_at: String,
}

/// Reads the identity stored at `path`.
///
/// # Errors
/// `Identity` if the file is missing, unreadable or malformed.
pub async fn load(path: impl AsRef<Path>) -> Result<AgentId> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AgentError::identity(&display, e.to_string()))?;
    let file: IdentityFile =
        serde_json::from_str(&content).map_err(|e| AgentError::identity(&display, e.to_string()))?;
    if file.version != IDENTITY_FILE_VERSION {
        return Err(AgentError::identity(
            display,
            format!("unsupported version {}", file.version),
        ));
    }
    Ok(file.agent_id)
}

/// Loads the identity at `path`, generating and persisting a new one if
/// the file does not exist.
///
/// # Errors
/// `Identity` if an existing file is unreadable or the new one cannot
/// be written.
pub async fn load_or_create(path: impl AsRef<Path>) -> Result<AgentId> {
    let path = path.as_ref();
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let id = load(path).await?;
        info!(agent_id = %id, path = %path.display(), "Loaded agent identity");
        return Ok(id);
    }

    let id = AgentId::generate();
    save(id, path).await?;
    info!(agent_id = %id, path = %path.display(), "Generated new agent identity");
    Ok(id)
}

async fn save(id: AgentId, path: &Path) -> Result<()> {
    let display = path.display().to_string();
    let io_err = |e: std::io::Error| AgentError::identity(&display, e.to_string());

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let file = IdentityFile {
        version: IDENTITY_FILE_VERSION,
        agent_id: id,
        created_at: timestamp(),
    };
    let content = serde_json::to_string_pretty(&file)
        .map_err(|e| AgentError::identity(&display, e.to_string()))?;
    tokio::fs::write(path, content).await.map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(path).await.map_err(io_err)?.permissions();
        perms.set_mode(0o600);
        tokio::fs::set_permissions(path, perms).await.map_err(io_err)?;
    }

    Ok(())
}

/// Seconds since the epoch with a `Z` suffix.
fn timestamp() -> String {
    format!("{}Z", Timestamp::now())
}

// ============================================
// Tests
// ============================================
