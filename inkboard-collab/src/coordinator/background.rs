//! Background image sync.
//!
//! Drag/resize produces a burst of transforms; they are folded into one
//! pending state and written after a quiet period. Loading, removing or
//! resetting the image writes at once and drops whatever was pending.

use std::time::Duration;

use inkboard_core::{BackgroundState, BackgroundTransform};
use tokio::time::Instant;

use super::debounce::Debounce;
use crate::error::ApplyError;
use crate::render::RenderTarget;

#[derive(Debug)]
pub struct BackgroundSync {
    debounce: Debounce,
    pending: Option<BackgroundState>,
    /// Set while a remote state is pushed into the target
    applying_remote: bool,
    /// Last remote transform shown, until the target echoes it back
    last_remote: Option<BackgroundTransform>,
}

impl BackgroundSync {
    pub fn new(delay: Duration) -> Self {
        Self {
            debounce: Debounce::new(delay),
            pending: None,
            applying_remote: false,
            last_remote: None,
        }
    }

    /// Fold a scale change into the pending state. `current` is the stored
    /// background, used when nothing is pending yet.
    pub fn stage_scale(&mut self, current: Option<BackgroundState>, scale: f64, now: Instant) -> bool {
        let Some(base) = self.pending.clone().or(current) else {
            return false;
        };
        let transform = BackgroundTransform { scale, ..base.transform() };
        self.stage(base, transform, now)
    }

    pub fn stage_transform(
        &mut self,
        current: Option<BackgroundState>,
        transform: BackgroundTransform,
        now: Instant,
    ) -> bool {
        let Some(base) = self.pending.clone().or(current) else {
            return false;
        };
        self.stage(base, transform, now)
    }

    fn stage(&mut self, base: BackgroundState, transform: BackgroundTransform, now: Instant) -> bool {
        if self.applying_remote {
            return false;
        }
        if self.last_remote.take() == Some(transform) {
            log::trace!("Ignoring echoed background transform");
            return false;
        }
        self.pending = Some(base.with_transform(transform));
        self.debounce.schedule(now);
        true
    }

    /// The pending state, once the quiet period is over.
    pub fn take_due(&mut self, now: Instant) -> Option<BackgroundState> {
        if self.debounce.fire_if_due(now) {
            self.pending.take()
        } else {
            None
        }
    }

    /// Drop the pending state; immediate writes supersede it.
    pub fn cancel(&mut self) {
        self.debounce.cancel();
        self.pending = None;
    }

    pub fn pending(&self) -> Option<&BackgroundState> {
        self.pending.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debounce.deadline()
    }

    /// Show a remote background without reporting it back as local input.
    pub fn apply_remote<R: RenderTarget + ?Sized>(
        &mut self,
        state: Option<&BackgroundState>,
        render: &mut R,
    ) -> Result<(), ApplyError> {
        if render.background_state().as_ref() == state {
            return Ok(());
        }
        self.applying_remote = true;
        self.last_remote = state.map(BackgroundState::transform);
        let result = render.set_background_transform(state, false);
        self.applying_remote = false;
        result.map_err(ApplyError::Background)
    }
}
