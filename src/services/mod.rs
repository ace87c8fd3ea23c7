//! Services module for settlement logic and integrations

pub mod amount_policy;
pub mod notification;
pub mod settlement_orchestrator;
pub mod webhook_processor;

// Re-export orchestrator types
pub use crate::services::settlement_orchestrator::{
    FlowResult, OrchestratorDeps, OrchestratorError, OrchestratorResult, SettlementOrchestrator,
    SettlementStatus, SweepReport,
};
pub use crate::services::webhook_processor::{WebhookProcessor, WebhookProcessorError, WebhookReceipt};
