use crate::{
    routing::{GroundingPolicy, ModelRules, RoutingDecision, Universe},
    signature::{SignatureStore, hash_message},
};
use rand::Rng;
use serde_json::{Map, Value, json};

/// Result of rewriting a request body. The hash of the trailing message is
/// the cache key under which a signature harvested from the response stream
/// gets recorded.
pub struct TransformOutcome {
    pub request_hash: Option<String>,
}

/// Rewrites a chat request in place for its destination. Every rewrite is
/// idempotent so a fallback retry can run the pipeline again over an
/// already-transformed body.
pub fn transform_body(
    body: &mut Value,
    decision: &RoutingDecision,
    rules: &ModelRules,
    store: &SignatureStore,
) -> TransformOutcome {
    let Some(obj) = body.as_object_mut() else {
        return TransformOutcome { request_hash: None };
    };

    obj.insert("model".to_string(), Value::String(decision.model.clone()));

    // Hygiene applied to every request regardless of model family.
    obj.remove("stream_options");
    match decision.universe {
        Universe::Free => {
            // The free host caches aggressively; a seed forces a fresh
            // completion. Client-chosen seeds win.
            if !obj.contains_key("seed") {
                let seed: u32 = rand::thread_rng().gen_range(0..1_000_000);
                obj.insert("seed".to_string(), json!(seed));
            }
        }
        Universe::Enterprise => {
            obj.insert("private".to_string(), Value::Bool(true));
        }
    }

    let request_hash = obj
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.last())
        .map(hash_message);

    let has_tools = obj
        .get("tools")
        .and_then(Value::as_array)
        .is_some_and(|tools| !tools.is_empty());
    if has_tools {
        apply_tool_rules(obj, decision, rules);
    }

    if rules.inject_signatures {
        if let Some(messages) = obj.get_mut("messages").and_then(Value::as_array_mut) {
            inject_signatures(messages, store);
            repair_trailing_tool_id(messages);
        }
    }

    TransformOutcome { request_hash }
}

fn apply_tool_rules(obj: &mut Map<String, Value>, decision: &RoutingDecision, rules: &ModelRules) {
    if rules.loop_penalties {
        obj.insert("frequency_penalty".to_string(), json!(1.1));
        obj.insert("presence_penalty".to_string(), json!(0.4));
        obj.insert(
            "stop".to_string(),
            json!(["<|endoftext|>", "User:", "\nUser", "User :"]),
        );
    }

    if let Some(limit) = rules.max_tools {
        if let Some(tools) = obj.get_mut("tools").and_then(Value::as_array_mut) {
            tools.truncate(limit);
        }
    }

    if let Some(max) = rules.truncate_tool_ids {
        if let Some(messages) = obj.get_mut("messages").and_then(Value::as_array_mut) {
            for message in messages.iter_mut() {
                if let Some(calls) = message.get_mut("tool_calls").and_then(Value::as_array_mut) {
                    for call in calls {
                        if let Some(id) = call.get_mut("id") {
                            truncate_string(id, max);
                        }
                    }
                }
                if let Some(id) = message.get_mut("tool_call_id") {
                    truncate_string(id, max);
                }
            }
        }
    }

    if rules.drop_search_tool {
        let Some(tools) = obj.get_mut("tools").and_then(Value::as_array_mut) else {
            return;
        };
        // A pure search-tool list is left alone; the filter only runs once
        // function tools are in play and would conflict.
        if !tools.iter().any(is_function_tool) {
            return;
        }
        tools.retain(|tool| is_function_tool(tool) && tool_name(tool) != Some("google_search"));
        if tools.is_empty() {
            obj.remove("tools");
            obj.remove("tools_config");
            return;
        }
    }

    if rules.sanitize_schemas {
        if let Some(tools) = obj.get_mut("tools").and_then(Value::as_array_mut) {
            for tool in tools {
                sanitize_tool(tool);
            }
        }
    }

    let disable_grounding = match rules.grounding {
        GroundingPolicy::Keep => false,
        GroundingPolicy::DisableAlways => true,
        GroundingPolicy::DisableOnFree => decision.universe == Universe::Free,
    };
    if disable_grounding {
        obj.insert(
            "tools_config".to_string(),
            json!({ "google_search_retrieval": { "disable": true } }),
        );
    }
}

fn is_function_tool(tool: &Value) -> bool {
    tool.get("type").and_then(Value::as_str) == Some("function") || tool.get("function").is_some()
}

fn tool_name(tool: &Value) -> Option<&str> {
    tool.get("function")
        .and_then(|function| function.get("name"))
        .or_else(|| tool.get("name"))
        .and_then(Value::as_str)
}

fn truncate_string(value: &mut Value, max: usize) {
    if let Some(s) = value.as_str() {
        if s.chars().count() > max {
            *value = Value::String(s.chars().take(max).collect());
        }
    }
}

/// Replaces `$ref`/`ref` nodes with the referenced definition, then recurses
/// into `properties` and `items`. An unresolvable reference degrades to a
/// described string instead of failing the request.
pub fn dereference_schema(schema: &mut Value, root_defs: Option<&Map<String, Value>>) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    let ref_key = obj
        .get("$ref")
        .or_else(|| obj.get("ref"))
        .and_then(Value::as_str)
        .map(|target| target.rsplit('/').next().unwrap_or(target).to_string());
    if let Some(key) = ref_key {
        obj.remove("$ref");
        obj.remove("ref");
        match root_defs.and_then(|defs| defs.get(&key)).cloned() {
            Some(mut definition) => {
                dereference_schema(&mut definition, root_defs);
                if let Some(fields) = definition.as_object() {
                    for (name, value) in fields {
                        obj.insert(name.clone(), value.clone());
                    }
                }
            }
            None => {
                obj.retain(|name, _| name == "description" || name == "default");
                let description = obj
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                obj.insert("type".to_string(), Value::String("string".to_string()));
                obj.insert(
                    "description".to_string(),
                    Value::String(format!("{description} [Ref Failed]")),
                );
            }
        }
    }

    if let Some(properties) = obj.get_mut("properties").and_then(Value::as_object_mut) {
        for value in properties.values_mut() {
            dereference_schema(value, root_defs);
        }
    }
    if let Some(items) = obj.get_mut("items") {
        dereference_schema(items, root_defs);
    }
    obj.remove("optional");
    obj.remove("title");
}

/// Inlines schema references in a tool declaration and strips the definition
/// tables, which strict upstream validators reject.
pub fn sanitize_tool(tool: &mut Value) {
    let Some(params) = tool
        .get_mut("function")
        .and_then(|function| function.get_mut("parameters"))
    else {
        return;
    };
    let defs = params
        .get("definitions")
        .or_else(|| params.get("$defs"))
        .and_then(Value::as_object)
        .cloned();
    dereference_schema(params, defs.as_ref());
    if let Some(obj) = params.as_object_mut() {
        obj.remove("definitions");
        obj.remove("$defs");
    }
}

/// Re-attaches cached thought signatures: each assistant turn gets the
/// signature recorded under the hash of the message preceding it, falling
/// back to the most recent signature seen this session. Existing signatures
/// are never overwritten.
fn inject_signatures(messages: &mut [Value], store: &SignatureStore) {
    let prev_hashes: Vec<Option<String>> = (0..messages.len())
        .map(|index| (index > 0).then(|| hash_message(&messages[index - 1])))
        .collect();

    for (message, prev_hash) in messages.iter_mut().zip(prev_hashes) {
        match message.get("role").and_then(Value::as_str) {
            Some("assistant") => {
                let Some(signature) = store.lookup_or_last(prev_hash.as_deref()) else {
                    continue;
                };
                let signature = Value::String(signature);
                set_if_absent(message, "thought_signature", &signature);
                if let Some(calls) = message.get_mut("tool_calls").and_then(Value::as_array_mut) {
                    for call in calls {
                        set_if_absent(call, "thought_signature", &signature);
                        if let Some(function) = call.get_mut("function") {
                            set_if_absent(function, "thought_signature", &signature);
                        }
                    }
                }
            }
            Some("tool") if prev_hash.is_some() => {
                if let Some(signature) = store.last() {
                    set_if_absent(message, "thought_signature", &Value::String(signature));
                }
            }
            _ => {}
        }
    }
}

fn set_if_absent(target: &mut Value, key: &str, value: &Value) {
    if let Some(obj) = target.as_object_mut() {
        if !obj.contains_key(key) {
            obj.insert(key.to_string(), value.clone());
        }
    }
}

/// Clients occasionally replay a stale `tool_call_id` on the trailing tool
/// message. Upstream rejects the mismatch, so rewrite it to the id of the
/// most recent assistant tool call.
fn repair_trailing_tool_id(messages: &mut [Value]) {
    let len = messages.len();
    if len < 2 || messages[len - 1].get("role").and_then(Value::as_str) != Some("tool") {
        return;
    }
    let original_id = messages[..len - 1].iter().rev().find_map(|message| {
        if message.get("role").and_then(Value::as_str) != Some("assistant") {
            return None;
        }
        message
            .get("tool_calls")?
            .as_array()?
            .first()?
            .get("id")
            .cloned()
    });
    if let Some(id) = original_id {
        if messages[len - 1].get("tool_call_id") != Some(&id) {
            messages[len - 1]["tool_call_id"] = id;
        }
    }
}
