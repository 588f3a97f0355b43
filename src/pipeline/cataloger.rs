//! Head-of-pipeline handler resolving raw frames into typed events.

use crate::core::{EventKind, decode_event};

use super::{
    ActionFlow, Continuation, EventFlow, EventHandler, HandlerRole, PipelineAction, PipelineError,
};

/// Decodes each delivered frame and forwards the typed event. Already-typed
/// events (synthesized view changes) pass through untouched.
#[derive(Default)]
pub struct EventCataloger;

impl EventCataloger {
    pub fn new() -> Self {
        Self
    }
}

impl EventHandler for EventCataloger {
    fn role(&self) -> HandlerRole {
        HandlerRole::EventCataloger
    }

    fn handle_event(
        &mut self,
        event: EventKind,
        _cont: &Continuation,
    ) -> Result<EventFlow, PipelineError> {
        let event = match event {
            EventKind::Raw(frame) => decode_event(&frame)?,
            typed => typed,
        };
        Ok(EventFlow::Forward(event))
    }

    fn handle_action(
        &mut self,
        _action: &mut PipelineAction,
    ) -> Result<ActionFlow, PipelineError> {
        Ok(ActionFlow::Forward)
    }
}
