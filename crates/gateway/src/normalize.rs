//! Payload normalizer (C6).
//!
//! Default behavior is passthrough: lift `call_id`s out of any
//! `function_call_output` items and otherwise leave the wire payload alone.
//! The store-disabled branch additionally strips/injects/rewrites
//! `previous_response_id` to keep a no-store session's turn sequence
//! coherent without server-side response storage to anchor it.

use serde_json::Value;

/// Literal placeholder output body synthesized for a pending tool call the
/// client never answered before starting a new turn.
pub const ABORTED_CALL_OUTPUT: &str = "aborted_by_gateway";

/// Everything C6 needs about the session this frame belongs to.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    pub expected_previous_response_id: String,
    pub pending_expected_call_ids: Vec<String>,
    pub store_disabled: bool,
    pub last_turn_replay_input: Option<Value>,
}

/// Result of normalizing one client frame.
#[derive(Debug, Clone)]
pub struct NormalizedTurn {
    pub payload: Value,
    pub previous_response_id: String,
    pub expected_previous_response_id: String,
    pub pending_expected_call_ids: Vec<String>,
    pub function_call_output_call_ids: Vec<String>,
    pub has_function_call_output_call_id: bool,
    /// Set when the store-disabled branch cleared the session's last
    /// response id; the caller must invoke its own `clearSessionLastResponseId`
    /// equivalent (deleting the sticky `response -> account`/`conn` bindings).
    pub cleared_session_last_response_id: bool,
}

/// Normalizes `payload` (a Responses-API turn) against `ctx`.
#[must_use]
pub fn normalize(mut payload: Value, ctx: &TurnContext) -> NormalizedTurn {
    let wire_previous_response_id = payload
        .get("previous_response_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let call_ids = function_call_output_call_ids(&payload);
    let has_call_ids = !call_ids.is_empty();

    let input = payload.get("input").cloned();
    let mut cleared = false;

    if ctx.store_disabled && input.as_ref() != ctx.last_turn_replay_input.as_ref() {
        strip_previous_response_id(&mut payload);
        cleared = true;
        return NormalizedTurn {
            payload,
            previous_response_id: String::new(),
            expected_previous_response_id: String::new(),
            pending_expected_call_ids: Vec::new(),
            function_call_output_call_ids: call_ids,
            has_function_call_output_call_id: has_call_ids,
            cleared_session_last_response_id: cleared,
        };
    }

    if wire_previous_response_id.is_empty()
        && !ctx.expected_previous_response_id.is_empty()
        && has_call_ids
    {
        set_previous_response_id(&mut payload, &ctx.expected_previous_response_id);
        let missing: Vec<String> = ctx
            .pending_expected_call_ids
            .iter()
            .filter(|id| !call_ids.contains(id))
            .cloned()
            .collect();
        append_aborted_outputs(&mut payload, &missing);

        return NormalizedTurn {
            payload,
            previous_response_id: ctx.expected_previous_response_id.clone(),
            expected_previous_response_id: ctx.expected_previous_response_id.clone(),
            pending_expected_call_ids: ctx.pending_expected_call_ids.clone(),
            function_call_output_call_ids: call_ids,
            has_function_call_output_call_id: has_call_ids,
            cleared_session_last_response_id: cleared,
        };
    }

    if !wire_previous_response_id.is_empty()
        && wire_previous_response_id != ctx.expected_previous_response_id
        && !ctx.expected_previous_response_id.is_empty()
        && has_call_ids
    {
        set_previous_response_id(&mut payload, &ctx.expected_previous_response_id);
        return NormalizedTurn {
            payload,
            previous_response_id: ctx.expected_previous_response_id.clone(),
            expected_previous_response_id: ctx.expected_previous_response_id.clone(),
            pending_expected_call_ids: ctx.pending_expected_call_ids.clone(),
            function_call_output_call_ids: call_ids,
            has_function_call_output_call_id: has_call_ids,
            cleared_session_last_response_id: cleared,
        };
    }

    NormalizedTurn {
        payload,
        previous_response_id: wire_previous_response_id,
        expected_previous_response_id: ctx.expected_previous_response_id.clone(),
        pending_expected_call_ids: ctx.pending_expected_call_ids.clone(),
        function_call_output_call_ids: call_ids,
        has_function_call_output_call_id: has_call_ids,
        cleared_session_last_response_id: false,
    }
}

fn function_call_output_call_ids(payload: &Value) -> Vec<String> {
    payload
        .get("input")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("function_call_output"))
                .filter_map(|item| item.get("call_id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn strip_previous_response_id(payload: &mut Value) {
    if let Some(obj) = payload.as_object_mut() {
        obj.retain(|key, _| key != "previous_response_id");
    }
}

fn set_previous_response_id(payload: &mut Value, value: &str) {
    if let Some(obj) = payload.as_object_mut() {
        obj.retain(|key, _| key != "previous_response_id");
        obj.insert("previous_response_id".to_string(), Value::String(value.to_string()));
    }
}

fn append_aborted_outputs(payload: &mut Value, missing_call_ids: &[String]) {
    if missing_call_ids.is_empty() {
        return;
    }
    let Some(obj) = payload.as_object_mut() else { return };
    let input = obj.entry("input").or_insert_with(|| Value::Array(Vec::new()));
    let Some(items) = input.as_array_mut() else { return };
    for call_id in missing_call_ids {
        items.push(serde_json::json!({
            "type": "function_call_output",
            "call_id": call_id,
            "output": ABORTED_CALL_OUTPUT,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_extracts_call_ids_without_mutating_payload() {
        let payload = serde_json::json!({
            "input": [{"type": "function_call_output", "call_id": "call_1"}],
        });
        let ctx = TurnContext::default();
        let result = normalize(payload.clone(), &ctx);
        assert_eq!(result.function_call_output_call_ids, vec!["call_1".to_string()]);
        assert_eq!(result.payload, payload);
    }

    #[test]
    fn store_disabled_edit_strips_previous_response_id_and_clears_session() {
        let payload = serde_json::json!({
            "previous_response_id": "resp_old",
            "input": [{"type": "message", "content": "hi"}],
        });
        let ctx = TurnContext {
            store_disabled: true,
            last_turn_replay_input: Some(serde_json::json!([{"type": "message", "content": "bye"}])),
            ..Default::default()
        };
        let result = normalize(payload, &ctx);
        assert!(result.payload.get("previous_response_id").is_none());
        assert!(result.cleared_session_last_response_id);
        assert!(result.previous_response_id.is_empty());
    }

    #[test]
    fn store_disabled_unchanged_input_is_passthrough() {
        let input = serde_json::json!([{"type": "message", "content": "hi"}]);
        let payload = serde_json::json!({ "input": input.clone() });
        let ctx = TurnContext {
            store_disabled: true,
            last_turn_replay_input: Some(input),
            ..Default::default()
        };
        let result = normalize(payload, &ctx);
        assert!(!result.cleared_session_last_response_id);
    }

    #[test]
    fn missing_previous_response_id_is_injected_with_aborted_outputs() {
        let payload = serde_json::json!({
            "input": [{"type": "function_call_output", "call_id": "call_1"}],
        });
        let ctx = TurnContext {
            expected_previous_response_id: "resp_expected".into(),
            pending_expected_call_ids: vec!["call_1".into(), "call_2".into()],
            ..Default::default()
        };
        let result = normalize(payload, &ctx);
        assert_eq!(result.previous_response_id, "resp_expected");
        let items = result.payload["input"].as_array().unwrap();
        assert!(items.iter().any(|i| i["call_id"] == "call_2" && i["output"] == ABORTED_CALL_OUTPUT));
        assert!(!items.iter().any(|i| i["call_id"] == "call_1" && i["output"] == ABORTED_CALL_OUTPUT));
    }

    #[test]
    fn wire_mismatch_is_rewritten_to_expected_when_call_outputs_present() {
        let payload = serde_json::json!({
            "previous_response_id": "resp_stale",
            "input": [{"type": "function_call_output", "call_id": "call_1"}],
        });
        let ctx = TurnContext {
            expected_previous_response_id: "resp_expected".into(),
            ..Default::default()
        };
        let result = normalize(payload, &ctx);
        assert_eq!(result.payload["previous_response_id"], "resp_expected");
    }

    #[test]
    fn wire_matching_expected_is_left_untouched() {
        let payload = serde_json::json!({
            "previous_response_id": "resp_expected",
            "input": [{"type": "function_call_output", "call_id": "call_1"}],
        });
        let ctx = TurnContext {
            expected_previous_response_id: "resp_expected".into(),
            ..Default::default()
        };
        let result = normalize(payload.clone(), &ctx);
        assert_eq!(result.payload, payload);
    }
}
