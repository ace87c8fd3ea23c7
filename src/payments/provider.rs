use crate::payments::error::GatewayResult;
use crate::payments::types::{
    CollectionAck, CollectionRequest, CollectionStatus, DisbursementAck, DisbursementRequest,
};
use async_trait::async_trait;

/// Pulls money from a payer's mobile wallet
#[async_trait]
pub trait CollectionGateway: Send + Sync {
    /// Prompt the payer to authorise a payment. Acceptance only means the prompt
    /// was sent; the result arrives later on the collection webhook.
    async fn request_collection(&self, request: CollectionRequest)
        -> GatewayResult<CollectionAck>;

    /// Ask the gateway for the final state of a push collection.
    async fn query_collection_status(
        &self,
        checkout_request_id: &str,
    ) -> GatewayResult<CollectionStatus>;
}

/// Pushes money to a payee's mobile wallet
#[async_trait]
pub trait DisbursementGateway: Send + Sync {
    async fn send_disbursement(
        &self,
        request: DisbursementRequest,
    ) -> GatewayResult<DisbursementAck>;
}
