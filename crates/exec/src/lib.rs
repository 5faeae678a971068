//! Authorization and execution of model-requested tool calls.
//!
//! [`ToolGuard`] decides whether a call may run (schema, sandbox, policy,
//! human approval) and records every decision in the audit log.
//! [`ToolExecutor`] runs what the guard allowed and always hands back a
//! [`ToolEnvelope`](coda_tools::ToolEnvelope), whatever the tool did.

pub mod executor;
pub mod guard;
pub mod policy;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

pub use executor::ToolExecutor;
pub use guard::{Decision, SessionPolicy, ToolGuard};
pub use policy::{CommandVerdict, ExecutionPolicy, PolicyError};

// ── Approval ─────────────────────────────────────────────────────────────────

/// What the guard shows a human before a gated call runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub call_id: String,
    pub tool_name: String,
    pub args: Value,
    pub risk_summary: String,
    /// Destructive shell command; "always" is not offered.
    pub destructive: bool,
    pub can_remember: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    /// Approve and skip the prompt for matching calls until the session ends.
    ApproveForSession,
    Deny,
}

/// One pending question plus the slot its answer goes into.
/// A reply slot dropped without an answer is read as `Deny`.
pub type PendingApproval = (ApprovalRequest, oneshot::Sender<ApprovalDecision>);
pub type ApprovalSender = mpsc::Sender<PendingApproval>;
pub type ApprovalReceiver = mpsc::Receiver<PendingApproval>;

const APPROVAL_QUEUE: usize = 16;

pub fn approval_channel() -> (ApprovalSender, ApprovalReceiver) {
    mpsc::channel(APPROVAL_QUEUE)
}
