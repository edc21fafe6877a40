// Sample `order` process: prepare, dispatch three parallel calls, finalize

use std::time::Duration;

use async_trait::async_trait;
use procflow_durable::engine::{
    GraphError, ProcessGraph, StepContext, StepError, StepHandler, StepRegistry,
};
use tracing::info;

pub const ORDER_PROCESS: &str = "order";

const CALLS_GROUP: &str = "calls";
const CALL_STEPS: [&str; 3] = ["call_a", "call_b", "call_c"];

/// `prepare -> dispatch -> {call_a, call_b, call_c} -> finalize`
pub fn order_graph() -> Result<ProcessGraph, GraphError> {
    ProcessGraph::builder(ORDER_PROCESS)
        .then("prepare", "dispatch")
        .fan_out("dispatch", CALLS_GROUP, CALL_STEPS)
        .join(CALLS_GROUP, "finalize")
        .complete("finalize")
        .build()
}

/// Register a handler for every step of the order graph
pub fn register_order_handlers(steps: &mut StepRegistry, delay: Duration) {
    steps.register_fn("prepare", move |ctx| async move {
        if !ctx.payload.is_object() {
            return Err(StepError::permanent(format!(
                "order payload must be a JSON object, got {}",
                ctx.payload
            )));
        }
        simulate_work(delay).await;
        info!(process_id = ctx.process_id, "Order prepared");
        Ok(())
    });

    steps.register_fn("dispatch", move |ctx| async move {
        simulate_work(delay).await;
        info!(process_id = ctx.process_id, calls = ?CALL_STEPS, "Dispatching calls");
        Ok(())
    });

    for call in CALL_STEPS {
        steps.register(call, SimulatedCall { delay });
    }

    steps.register_fn("finalize", move |ctx| async move {
        simulate_work(delay).await;
        info!(process_id = ctx.process_id, "Order finalized");
        Ok(())
    });
}

/// One outbound call of the fan-out
struct SimulatedCall {
    delay: Duration,
}

#[async_trait]
impl StepHandler for SimulatedCall {
    async fn execute(&self, ctx: &StepContext) -> Result<(), StepError> {
        simulate_work(self.delay).await;
        info!(
            process_id = ctx.process_id,
            call = %ctx.step_name,
            attempt = ctx.attempt,
            "Call finished"
        );
        Ok(())
    }
}

async fn simulate_work(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
