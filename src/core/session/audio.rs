//! Audio in both directions.
//!
//! Inbound: every binary frame becomes exactly one append operation, in
//! arrival order. Outbound: synthesized audio events keep all provider fields
//! and gain a per-response `seq`; the end-of-audio event gains `chunks`, the
//! number of deltas the client should have seen.

use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::HashMap;

use crate::core::upstream::UpstreamOp;

#[derive(Debug, Default)]
pub struct AudioRelay {
    /// Next sequence number per response
    sequences: HashMap<String, u64>,
    frames_in: u64,
}

impl AudioRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map one microphone frame to one append operation.
    pub fn encode_input(&mut self, frame: Bytes) -> UpstreamOp {
        self.frames_in += 1;
        UpstreamOp::AppendAudio(frame)
    }

    /// Number of inbound frames relayed so far
    pub fn frames_in(&self) -> u64 {
        self.frames_in
    }

    /// Add `seq` to an audio delta event and return it.
    pub fn tag_output(&mut self, event: &mut Value, response_id: &str) -> u64 {
        let counter = self.sequences.entry(response_id.to_string()).or_insert(0);
        let seq = *counter;
        *counter += 1;
        if let Some(obj) = event.as_object_mut() {
            obj.insert("seq".to_string(), json!(seq));
        }
        seq
    }

    /// Add `chunks` to an end-of-audio event and forget the response.
    pub fn finish_output(&mut self, event: &mut Value, response_id: &str) -> u64 {
        let chunks = self.sequences.remove(response_id).unwrap_or(0);
        if let Some(obj) = event.as_object_mut() {
            obj.insert("chunks".to_string(), json!(chunks));
        }
        chunks
    }

    /// Forget a response whose audio will never finish.
    pub fn discard(&mut self, response_id: &str) {
        self.sequences.remove(response_id);
    }
}
