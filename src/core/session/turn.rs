//! Utterance finalization.
//!
//! Two triggers can end an utterance: a fragment flagged final by the provider
//! and the quiet-period timer. Both go through [`TurnAccumulator::claim`], a
//! take-and-clear of the buffer, so whichever trigger comes second finds
//! nothing to commit. Timer expiries carry the epoch they were armed with and
//! are ignored once the epoch has moved on.

use std::mem;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::upstream::{FragmentMode, TranscriptFragment};

/// Default quiet period before a partial transcript is finalized.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(700);

/// Result of feeding one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// Nothing changed
    Ignored,
    /// Buffer updated; re-arm the finalize timer with `epoch`
    Partial { transcript: String, epoch: u64 },
    /// Timer must be disarmed; `Some` carries the committed utterance
    Finalized(Option<String>),
}

#[derive(Debug)]
pub struct TurnAccumulator {
    buffer: String,
    last_update: Option<Instant>,
    epoch: u64,
    armed: bool,
    quiet_period: Duration,
    /// Utterance id of the buffered text
    utterance: Option<String>,
    /// Utterance most recently committed
    finalized_utterance: Option<String>,
    /// The timer committed an utterance whose final fragment has not arrived
    awaiting_final: bool,
}

impl TurnAccumulator {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            buffer: String::new(),
            last_update: None,
            epoch: 0,
            armed: false,
            quiet_period,
            utterance: None,
            finalized_utterance: None,
            awaiting_final: false,
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    pub fn on_fragment(&mut self, fragment: &TranscriptFragment) -> FragmentOutcome {
        if let Some(id) = &fragment.utterance
            && self.finalized_utterance.as_ref() == Some(id)
        {
            return FragmentOutcome::Ignored;
        }

        if fragment.is_final {
            return self.on_final(fragment);
        }

        if fragment.text.trim().is_empty() {
            return FragmentOutcome::Ignored;
        }

        self.awaiting_final = false;
        match fragment.mode {
            FragmentMode::Append => self.buffer.push_str(&fragment.text),
            FragmentMode::Replace => self.buffer = fragment.text.clone(),
        }
        if fragment.utterance.is_some() {
            self.utterance = fragment.utterance.clone();
        }
        self.last_update = Some(Instant::now());
        self.epoch += 1;
        self.armed = true;

        FragmentOutcome::Partial {
            transcript: self.buffer.trim().to_string(),
            epoch: self.epoch,
        }
    }

    fn on_final(&mut self, fragment: &TranscriptFragment) -> FragmentOutcome {
        if self.awaiting_final && self.buffer.trim().is_empty() {
            // The timer already committed this utterance.
            self.awaiting_final = false;
            return FragmentOutcome::Ignored;
        }

        let text = fragment.text.trim();
        if !text.is_empty() {
            self.buffer = text.to_string();
        }

        self.disarm();
        let claimed = self.claim();
        let utterance = fragment.utterance.clone().or_else(|| self.utterance.take());
        if claimed.is_some() {
            self.finalized_utterance = utterance;
        }
        FragmentOutcome::Finalized(claimed)
    }

    /// Timer expiry for `epoch`. Stale or disarmed timers commit nothing.
    pub fn on_timer(&mut self, epoch: u64) -> Option<String> {
        if !self.armed || epoch != self.epoch {
            return None;
        }
        self.armed = false;

        let claimed = self.claim();
        if claimed.is_some() {
            self.awaiting_final = true;
            self.finalized_utterance = self.utterance.take();
        }
        claimed
    }

    /// Take the buffered text and clear it. Empty buffers yield `None`.
    pub fn claim(&mut self) -> Option<String> {
        let text = mem::take(&mut self.buffer);
        self.last_update = None;
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Invalidate any pending timer.
    pub fn disarm(&mut self) {
        self.armed = false;
        self.epoch += 1;
    }
}

impl Default for TurnAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_PERIOD)
    }
}
