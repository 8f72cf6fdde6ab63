use async_trait::async_trait;
use relaycore::{
    ExecutionError, ExecutorMetadata, NodeConfig, StepContext, StepExecutor, StepOutput,
};
use tokio::time::sleep;

/// Waits for the configured duration, then passes its input through.
pub struct DelayNode;

#[async_trait]
impl StepExecutor for DelayNode {
    fn node_type(&self) -> &str {
        "delay"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        let NodeConfig::Delay(cfg) = &ctx.config else {
            return Err(ExecutionError::internal("delay node received foreign config"));
        };

        ctx.events
            .info(format!("Delaying for {}ms", cfg.duration.as_millis()))
            .await;

        tokio::select! {
            _ = sleep(cfg.duration) => Ok(StepOutput::value(ctx.input.to_value())),
            _ = ctx.cancellation.cancelled() => Err(ExecutionError::cancelled()),
        }
    }

    fn metadata(&self) -> ExecutorMetadata {
        ExecutorMetadata::new("Delay execution for specified milliseconds", "time")
    }
}
