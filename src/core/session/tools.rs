//! Streamed function-call reconstruction.

use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::errors::BridgeError;

/// Lifecycle of one call. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallState {
    Collecting,
    Ready,
    Executed,
    Reported,
}

#[derive(Debug)]
struct PendingToolCall {
    name: String,
    arguments: String,
    state: CallState,
    output: Option<Value>,
}

/// A call whose arguments are complete.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyCall {
    pub call_id: String,
    pub name: String,
    /// Always a JSON object
    pub arguments: Value,
    /// Why the streamed text could not be used
    pub parse_error: Option<String>,
}

impl ReadyCall {
    /// Argument failure as a bridge error, for reporting.
    pub fn argument_error(&self) -> Option<BridgeError> {
        self.parse_error.as_ref().map(|reason| BridgeError::ToolArgumentParse {
            call_id: self.call_id.clone(),
            reason: reason.clone(),
        })
    }
}

/// A call with a result, ready to report upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedCall {
    pub call_id: String,
    pub name: String,
    pub output: Value,
}

/// Pending calls keyed by `call_id`, remembered in announcement order.
#[derive(Debug, Default)]
pub struct ToolCallAggregator {
    calls: HashMap<String, PendingToolCall>,
    order: VecDeque<String>,
}

impl ToolCallAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn state(&self, call_id: &str) -> Option<CallState> {
        self.calls.get(call_id).map(|c| c.state)
    }

    /// Record a call announcement. Duplicate announcements are ignored.
    pub fn announce(&mut self, call_id: &str, name: &str) -> bool {
        if self.calls.contains_key(call_id) {
            debug!(call_id = %call_id, "Duplicate function call announcement ignored");
            return false;
        }
        self.calls.insert(
            call_id.to_string(),
            PendingToolCall {
                name: name.to_string(),
                arguments: String::new(),
                state: CallState::Collecting,
                output: None,
            },
        );
        self.order.push_back(call_id.to_string());
        true
    }

    /// Append an argument fragment in arrival order.
    pub fn append(&mut self, call_id: &str, delta: &str) {
        match self.calls.get_mut(call_id) {
            Some(call) if call.state == CallState::Collecting => call.arguments.push_str(delta),
            Some(call) => {
                debug!(call_id = %call_id, state = ?call.state, "Argument fragment after done ignored")
            }
            None => warn!(call_id = %call_id, "Argument fragment for unannounced call"),
        }
    }

    /// Mark arguments complete and parse them.
    ///
    /// `done_arguments` is only used when no fragments were streamed. Text
    /// that is not a JSON object becomes an empty object.
    pub fn mark_ready(&mut self, call_id: &str, done_arguments: &str) -> Option<ReadyCall> {
        let call = self.calls.get_mut(call_id)?;
        if call.state != CallState::Collecting {
            return None;
        }
        call.state = CallState::Ready;

        let text = if call.arguments.is_empty() {
            done_arguments
        } else {
            call.arguments.as_str()
        };

        let (arguments, parse_error) = match parse_arguments(text) {
            Ok(args) => (args, None),
            Err(reason) => (Value::Object(Map::new()), Some(reason)),
        };

        Some(ReadyCall {
            call_id: call_id.to_string(),
            name: call.name.clone(),
            arguments,
            parse_error,
        })
    }

    /// Store a call's result. Only `Ready` calls accept one.
    pub fn record_result(&mut self, call_id: &str, output: Value) -> bool {
        match self.calls.get_mut(call_id) {
            Some(call) if call.state == CallState::Ready => {
                call.state = CallState::Executed;
                call.output = Some(output);
                true
            }
            _ => false,
        }
    }

    /// Remove and return executed calls that may be reported now.
    ///
    /// With `in_order`, reporting stops at the first announced call that is
    /// still running, so results go out in announcement order.
    pub fn take_reportable(&mut self, in_order: bool) -> Vec<CompletedCall> {
        let mut reportable = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.order.len());

        while let Some(call_id) = self.order.pop_front() {
            let executed = self
                .calls
                .get(&call_id)
                .is_some_and(|c| c.state == CallState::Executed);

            if executed {
                if let Some(mut call) = self.calls.remove(&call_id) {
                    call.state = CallState::Reported;
                    reportable.push(CompletedCall {
                        call_id,
                        name: call.name,
                        output: call.output.take().unwrap_or(Value::Null),
                    });
                }
            } else {
                remaining.push_back(call_id);
                if in_order {
                    remaining.extend(self.order.drain(..));
                    break;
                }
            }
        }

        self.order = remaining;
        reportable
    }

    /// Drop calls whose arguments never completed. Returns their ids.
    pub fn abandon_incomplete(&mut self) -> Vec<String> {
        let abandoned: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                self.calls
                    .get(id.as_str())
                    .is_some_and(|c| c.state == CallState::Collecting)
            })
            .cloned()
            .collect();

        for id in &abandoned {
            self.calls.remove(id);
            warn!(call_id = %id, "Function call never completed, dropping");
        }
        self.order.retain(|id| self.calls.contains_key(id));
        abandoned
    }

    pub fn clear(&mut self) {
        self.calls.clear();
        self.order.clear();
    }
}

fn parse_arguments(text: &str) -> Result<Value, String> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("arguments are not a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fragments_reconstruct_arguments() {
        let mut agg = ToolCallAggregator::new();
        agg.announce("c1", "search");
        agg.append("c1", r#"{"q":"#);
        agg.append("c1", r#""test"}"#);

        let ready = agg.mark_ready("c1", "").unwrap();
        assert_eq!(ready.name, "search");
        assert_eq!(ready.arguments, json!({"q": "test"}));
        assert!(ready.parse_error.is_none());
        assert_eq!(agg.state("c1"), Some(CallState::Ready));
    }

    #[test]
    fn test_done_payload_used_without_fragments() {
        let mut agg = ToolCallAggregator::new();
        agg.announce("c1", "search");
        let ready = agg.mark_ready("c1", r#"{"q":"x"}"#).unwrap();
        assert_eq!(ready.arguments, json!({"q": "x"}));
    }

    #[test]
    fn test_premature_done_degrades_to_empty() {
        let mut agg = ToolCallAggregator::new();
        agg.announce("c1", "search");
        agg.append("c1", r#"{"q":"#);

        let ready = agg.mark_ready("c1", r#"{"q":"full"}"#).unwrap();
        assert_eq!(ready.arguments, json!({}));
        assert!(ready.parse_error.is_some());
        assert!(matches!(
            ready.argument_error(),
            Some(BridgeError::ToolArgumentParse { ref call_id, .. }) if call_id == "c1"
        ));
    }

    #[test]
    fn test_non_object_arguments_degrade_to_empty() {
        let mut agg = ToolCallAggregator::new();
        agg.announce("c1", "search");
        let ready = agg.mark_ready("c1", "[1,2]").unwrap();
        assert_eq!(ready.arguments, json!({}));
        assert!(ready.parse_error.is_some());
    }

    #[test]
    fn test_states_are_monotonic() {
        let mut agg = ToolCallAggregator::new();
        agg.announce("c1", "search");
        assert!(!agg.record_result("c1", json!(1)));

        agg.mark_ready("c1", "{}").unwrap();
        assert!(agg.mark_ready("c1", "{}").is_none());

        agg.append("c1", "ignored");
        assert!(agg.record_result("c1", json!({"ok": true})));
        assert!(!agg.record_result("c1", json!({"ok": false})));
        assert_eq!(agg.state("c1"), Some(CallState::Executed));
    }

    #[test]
    fn test_duplicate_announcement_ignored() {
        let mut agg = ToolCallAggregator::new();
        assert!(agg.announce("c1", "search"));
        assert!(!agg.announce("c1", "other"));
        assert_eq!(agg.mark_ready("c1", "{}").unwrap().name, "search");
    }

    #[test]
    fn test_reports_follow_announcement_order() {
        let mut agg = ToolCallAggregator::new();
        agg.announce("c1", "a");
        agg.announce("c2", "b");
        agg.mark_ready("c1", "{}");
        agg.mark_ready("c2", "{}");

        agg.record_result("c2", json!("second"));
        assert!(agg.take_reportable(true).is_empty());

        agg.record_result("c1", json!("first"));
        let reported = agg.take_reportable(true);
        let ids: Vec<_> = reported.iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_reports_any_order_when_independent() {
        let mut agg = ToolCallAggregator::new();
        agg.announce("c1", "a");
        agg.announce("c2", "b");
        agg.mark_ready("c1", "{}");
        agg.mark_ready("c2", "{}");

        agg.record_result("c2", json!("second"));
        let reported = agg.take_reportable(false);
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].call_id, "c2");
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_abandon_incomplete() {
        let mut agg = ToolCallAggregator::new();
        agg.announce("c1", "a");
        agg.announce("c2", "b");
        agg.mark_ready("c2", "{}");

        assert_eq!(agg.abandon_incomplete(), vec!["c1".to_string()]);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg.state("c2"), Some(CallState::Ready));
    }
}
