//! State-machine commands and their wire outcomes.
//!
//! Every metadata mutation is one command appended to the replicated log.
//! Outcomes cross the leader-forward HTTP channel, so logical errors travel
//! as a small string taxonomy rather than as rich error types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{FsError, FsResult, Inode, LinkStatus, SingleUseLink};

/// Wire tags for logical errors
pub const ERR_NOT_FOUND: &str = "not_found";
pub const ERR_ALREADY_EXISTS: &str = "already_exists";
pub const ERR_GONE: &str = "gone";

/// Tagged union of metadata mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataCommand {
    CreateMetadata(Inode),
    UpdateMetadata(Inode),
    DeleteMetadata {
        path: String,
    },
    CreateLink(SingleUseLink),
    UpdateLink {
        token: String,
        status: LinkStatus,
        used_at: Option<DateTime<Utc>>,
        used_by_ip: Option<String>,
    },
    DeleteLink {
        token: String,
    },
    CleanupExpiredLinks {
        before: DateTime<Utc>,
    },
    CleanupUsedLinks {
        older_than: DateTime<Utc>,
    },
}

/// Entries carried by the replicated log: metadata commands plus
/// configuration changes, which replicate like any other entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogCommand {
    Noop,
    Metadata(MetadataCommand),
    AddVoter {
        node_id: String,
        raft_addr: String,
        api_endpoint: String,
    },
    RemoveVoter {
        node_id: String,
    },
}

/// Result of one applied command, encodable for the forward channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_count: Option<u64>,
}

impl CommandOutcome {
    pub fn success(cleanup_count: Option<u64>) -> Self {
        Self {
            ok: true,
            error: None,
            message: None,
            cleanup_count,
        }
    }

    pub fn failure(err: &FsError) -> Self {
        let tag = match err {
            FsError::NotFound(_) => ERR_NOT_FOUND,
            FsError::AlreadyExists(_) => ERR_ALREADY_EXISTS,
            FsError::Gone(_) => ERR_GONE,
            _ => "internal",
        };
        Self {
            ok: false,
            error: Some(tag.to_string()),
            message: Some(err.to_string()),
            cleanup_count: None,
        }
    }

    pub fn from_result(result: FsResult<Option<u64>>) -> Self {
        match result {
            Ok(count) => Self::success(count),
            Err(err) => Self::failure(&err),
        }
    }

    /// Translate the wire taxonomy back into local errors.
    pub fn into_result(self) -> FsResult<Option<u64>> {
        if self.ok {
            return Ok(self.cleanup_count);
        }
        let message = self.message.unwrap_or_else(|| "command failed".to_string());
        match self.error.as_deref() {
            Some(ERR_NOT_FOUND) => Err(FsError::NotFound(message)),
            Some(ERR_ALREADY_EXISTS) => Err(FsError::AlreadyExists(message)),
            Some(ERR_GONE) => Err(FsError::Gone(message)),
            _ => Err(FsError::Internal(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BackendKind;

    #[test]
    fn test_command_encoding_round_trip() {
        let cmd = LogCommand::Metadata(MetadataCommand::CreateMetadata(Inode::new_file(
            "/a",
            1,
            BackendKind::Localfs,
        )));
        let bytes = bincode::serialize(&cmd).unwrap();
        let decoded: LogCommand = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_outcome_taxonomy_round_trip() {
        let outcome = CommandOutcome::failure(&FsError::NotFound("x".into()));
        assert_eq!(outcome.error.as_deref(), Some(ERR_NOT_FOUND));
        assert!(outcome.clone().into_result().unwrap_err().is_not_found());

        let outcome = CommandOutcome::failure(&FsError::AlreadyExists("x".into()));
        assert!(outcome.into_result().unwrap_err().is_already_exists());

        let outcome = CommandOutcome::success(Some(3));
        assert_eq!(outcome.into_result().unwrap(), Some(3));
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(CommandOutcome::success(Some(2))).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["cleanup_count"], 2);
        assert!(json.get("error").is_none());
    }
}
