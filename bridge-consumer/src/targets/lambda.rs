use async_trait::async_trait;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::InvocationType;
use bridge_common::delivery::Delivery;
use bytes::Bytes;
use serde_json::json;
use tracing::error;

use crate::error::TargetError;
use crate::targets::{Target, ROOT_JWT};

/// Invokes a remote function named after the service, with the same envelope
/// the HTTP target uses wrapped in a request description.
pub struct LambdaTarget {
    client: aws_sdk_lambda::Client,
    function_name: String,
    invocation_type: InvocationType,
}

impl LambdaTarget {
    pub fn new(
        client: aws_sdk_lambda::Client,
        function_name: String,
        invocation_type: &str,
    ) -> Self {
        LambdaTarget {
            client,
            function_name,
            invocation_type: InvocationType::from(invocation_type),
        }
    }
}

#[async_trait]
impl Target for LambdaTarget {
    async fn handle(&self, delivery: &Delivery) -> Result<Option<Bytes>, TargetError> {
        let payload = json!({
            "method": "POST",
            "url": format!("/consume?jwt={ROOT_JWT}"),
            "headers": {"Content-Type": "application/json"},
            "body": {
                "routingKey": delivery.routing_key,
                "body": String::from_utf8_lossy(&delivery.body),
                "context": delivery.headers,
            },
        });

        let payload = serde_json::to_vec(&payload)
            .map_err(|err| TargetError::Transient(format!("failed encoding payload: {err}")))?;

        self.client
            .invoke()
            .function_name(&self.function_name)
            .invocation_type(self.invocation_type.clone())
            .payload(Blob::new(payload))
            .send()
            .await
            .map_err(|err| {
                error!(
                    error = %err,
                    function = %self.function_name,
                    "failed to invoke lambda function"
                );
                TargetError::Transient("failed to invoke lambda function".to_owned())
            })?;

        Ok(None)
    }
}
