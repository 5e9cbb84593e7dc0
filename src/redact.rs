use std::collections::BTreeMap;

use serde_json::Value;

use crate::snapshot::{HttpResponse, Snapshot};

pub const REDACTED_VALUE: &str = "[REDACTED]";

/// Replaces sensitive field values with `[REDACTED]` in place, before the
/// snapshot is persisted.
///
/// Paths are dotted: `request.headers.<name>`, `response.body.a.b.c`, or a
/// `*.` prefix that applies to both sides, to every outgoing request, and at
/// any depth inside bodies. A bare segment under `request.`/`response.` is
/// treated as a body field name at any depth and as a header name.
pub fn redact_snapshot(snap: &mut Snapshot, fields: &[String]) {
    for field in fields {
        let parts: Vec<&str> = field.split('.').collect();
        if parts.len() < 2 {
            continue;
        }

        match parts[0] {
            "request" => {
                redact_in_side(&mut snap.request.headers, &mut snap.request.body, &parts[1..]);
            }
            "response" => {
                redact_in_side(
                    &mut snap.response.headers,
                    &mut snap.response.body,
                    &parts[1..],
                );
            }
            "*" => {
                redact_in_side(&mut snap.request.headers, &mut snap.request.body, &parts[1..]);
                redact_in_side(
                    &mut snap.response.headers,
                    &mut snap.response.body,
                    &parts[1..],
                );
                for outgoing in &mut snap.outgoing_requests {
                    redact_in_side(&mut outgoing.headers, &mut outgoing.body, &parts[1..]);
                    if let Some(response) = outgoing.response.as_mut() {
                        redact_in_response(response, &parts[1..]);
                    }
                }
            }
            _ => {}
        }
    }
}

fn redact_in_response(response: &mut HttpResponse, path: &[&str]) {
    redact_in_side(&mut response.headers, &mut response.body, path);
}

fn redact_in_side(headers: &mut BTreeMap<String, String>, body: &mut Value, path: &[&str]) {
    let Some(first) = path.first() else { return };

    match *first {
        "headers" => {
            if path.len() == 2 {
                redact_header(headers, path[1]);
            }
        }
        "body" => {
            if path.len() >= 2 {
                redact_in_body(body, &path[1..]);
            }
        }
        field => {
            // A bare segment names a body field at any depth, and a header.
            redact_field_recursive(body, field);
            redact_header(headers, field);
        }
    }
}

/// Header keys are stored case-folded, so the path segment matches
/// case-insensitively.
fn redact_header(headers: &mut BTreeMap<String, String>, name: &str) {
    let folded = name.to_ascii_lowercase();
    if let Some(value) = headers.get_mut(&folded) {
        *value = REDACTED_VALUE.to_owned();
    }
}

fn redact_in_body(body: &mut Value, path: &[&str]) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    let Value::Object(map) = body else { return };

    if rest.is_empty() {
        if let Some(value) = map.get_mut(*first) {
            *value = Value::String(REDACTED_VALUE.to_owned());
        }
        return;
    }

    if let Some(nested) = map.get_mut(*first) {
        redact_in_body(nested, rest);
    }
}

fn redact_field_recursive(body: &mut Value, field: &str) {
    let Value::Object(map) = body else { return };

    if let Some(value) = map.get_mut(field) {
        *value = Value::String(REDACTED_VALUE.to_owned());
    }
    for (key, value) in map.iter_mut() {
        if key != field && value.is_object() {
            redact_field_recursive(value, field);
        }
    }
}
