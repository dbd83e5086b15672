use serde::{Deserialize, Serialize};

use ax_core::types::{Execution, UserRole};

/// Messages delivered to dashboard sockets.
///
/// Every variant except the handshake acknowledgements is addressed to one
/// `org:{orgId}` room; there is no global broadcast path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "kebab-case")]
#[allow(clippy::large_enum_variant)]
pub enum RoomMessage {
    /// An execution was created or changed status.
    ExecutionUpdated(Execution),
    /// A live log line for one task.
    #[serde(rename_all = "camelCase")]
    ExecutionLog { task_id: String, log: String },
    /// Handshake accepted; the socket has joined its org room.
    #[serde(rename_all = "camelCase")]
    AuthSuccess {
        org_id: String,
        user_id: String,
        role: UserRole,
    },
    /// Handshake rejected; the server closes after sending this.
    AuthError { message: String },
    /// Keepalive.
    Ping { timestamp: String },
}
