//! JSON reply printed by the plugin for every invocation.

use serde::{Deserialize, Serialize};

use crate::error::MaprError;

/// Outcome of a plugin operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    Success,
    Failure,
    #[serde(rename = "Not supported")]
    NotSupported,
}

/// Features advertised in the `init` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub attach: bool,
    pub selinux_relabel: bool,
}

/// The single JSON object a plugin invocation writes to stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

impl DriverReply {
    pub fn success() -> Self {
        Self {
            status: ReplyStatus::Success,
            message: None,
            capabilities: None,
        }
    }

    /// Reply to `init`: no attach/detach phase, no SELinux relabelling.
    pub fn initialized() -> Self {
        Self {
            capabilities: Some(Capabilities {
                attach: false,
                selinux_relabel: false,
            }),
            ..Self::success()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Failure,
            message: Some(message.into()),
            capabilities: None,
        }
    }

    pub fn not_supported() -> Self {
        Self {
            status: ReplyStatus::NotSupported,
            message: None,
            capabilities: None,
        }
    }

    /// Process exit code: only failures exit non-zero.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            ReplyStatus::Failure => 1,
            ReplyStatus::Success | ReplyStatus::NotSupported => 0,
        }
    }

    /// Single-line JSON encoding.
    pub fn to_json(&self) -> String {
        // Every field is a plain string or bool.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":"Failure","message":"cannot encode reply"}"#.to_owned()
        })
    }
}

impl From<MaprError> for DriverReply {
    fn from(e: MaprError) -> Self {
        // Keep the reply on one line whatever the error carried.
        let message = e.to_string().replace(['\n', '\r'], " ");
        Self::failure(message)
    }
}

impl From<Result<(), MaprError>> for DriverReply {
    fn from(r: Result<(), MaprError>) -> Self {
        match r {
            Ok(()) => Self::success(),
            Err(e) => e.into(),
        }
    }
}
