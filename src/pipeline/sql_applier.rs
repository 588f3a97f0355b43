//! Tail-of-pipeline handler feeding the engine's apply channel.

use std::sync::Arc;

use crate::core::encode_event;
use crate::core::EventKind;
use crate::engine::{APPLIER_CHANNEL, Engine, ReplicationChannel, ThreadMask};

use super::{
    ActionFlow, Continuation, EventFlow, EventHandler, HandlerRole, PipelineAction, PipelineError,
};

/// Queues every surviving event to the `sql_applier` relay-log channel,
/// where the engine's apply thread replays it.
pub struct SqlApplierHandler {
    engine: Arc<dyn Engine>,
    channel: Option<Arc<dyn ReplicationChannel>>,
}

impl SqlApplierHandler {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            channel: None,
        }
    }
}

impl EventHandler for SqlApplierHandler {
    fn role(&self) -> HandlerRole {
        HandlerRole::Applier
    }

    fn terminate(&mut self) -> Result<(), PipelineError> {
        if let Some(channel) = self.channel.take() {
            channel.stop_threads(false, ThreadMask::Applier)?;
        }
        Ok(())
    }

    fn handle_event(
        &mut self,
        event: EventKind,
        cont: &Continuation,
    ) -> Result<EventFlow, PipelineError> {
        let channel = self
            .channel
            .as_ref()
            .ok_or(PipelineError::ApplierNotConfigured)?;
        channel.queue_event(encode_event(&event))?;
        cont.signal(Ok(()), false);
        Ok(EventFlow::Done)
    }

    fn handle_action(
        &mut self,
        action: &mut PipelineAction,
    ) -> Result<ActionFlow, PipelineError> {
        match action {
            PipelineAction::ApplierConfig {
                reset_logs,
                cluster_sid,
                last_queued_gno,
                ..
            } => {
                let channel = self.engine.replication_channel(APPLIER_CHANNEL)?;
                channel.initialize_repositories()?;
                if *reset_logs {
                    channel.purge_relay_logs()?;
                }
                *last_queued_gno = Some(channel.last_delivered_gno(*cluster_sid)?);
                channel.start_replication_threads(ThreadMask::Applier, false)?;
                self.channel = Some(channel);
                Ok(ActionFlow::Consumed)
            }
            PipelineAction::Stop => {
                if let Some(channel) = &self.channel {
                    channel.stop_threads(false, ThreadMask::Applier)?;
                }
                Ok(ActionFlow::Forward)
            }
            _ => Ok(ActionFlow::Forward),
        }
    }
}
