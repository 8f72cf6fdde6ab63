use async_trait::async_trait;
use relaycore::{
    ExecutionError, ExecutorMetadata, NodeConfig, StepContext, StepExecutor, StepOutput,
};

/// Entry point of a graph; emits its configured payload or the run input.
pub struct TriggerNode;

#[async_trait]
impl StepExecutor for TriggerNode {
    fn node_type(&self) -> &str {
        "trigger"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        let payload = match &ctx.config {
            NodeConfig::Trigger(cfg) => cfg.payload.clone(),
            _ => None,
        };
        match payload {
            Some(payload) => {
                ctx.events.info("Using configured payload").await;
                Ok(StepOutput::value(payload))
            }
            None => Ok(StepOutput::value(ctx.input.to_value())),
        }
    }

    fn metadata(&self) -> ExecutorMetadata {
        ExecutorMetadata::new("Start a workflow with the run input", "trigger")
    }
}
