use anyhow::Context as _;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Map, Value, json};

/// Marker value of the `encoding` field for base64-wrapped binary bodies.
pub const ENCODING_BASE64: &str = "base64";
/// Marker value of the `encoding` field for verbatim text bodies.
pub const ENCODING_TEXT: &str = "text";

const BINARY_CONTENT_TYPES: &[&str] = &[
    "application/grpc",
    "application/grpc-web",
    "application/grpc-web+proto",
    "application/protobuf",
    "application/x-protobuf",
    "application/x-google-protobuf",
    "application/msgpack",
    "application/x-msgpack",
    "application/octet-stream",
    "application/cbor",
    "application/thrift",
    "application/avro",
    "application/flatbuffers",
];

/// Interprets raw HTTP body bytes based on the content type.
///
/// JSON content types parse into structured values, text content types become
/// UTF-8 strings, and binary payloads (protobuf, msgpack, grpc, octet-stream)
/// are wrapped in a `{data, encoding: "base64"}` record so the original bytes
/// survive the round trip through a snapshot file.
pub fn parse_body(raw: &[u8], content_type: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }

    let ct = content_type.to_ascii_lowercase();

    if is_binary_content_type(&ct) {
        return base64_record(raw);
    }

    if is_json_content_type(&ct) || ct.is_empty() {
        if let Ok(parsed) = serde_json::from_slice::<Value>(raw) {
            return parsed;
        }
    }

    if is_text_content_type(&ct) {
        return Value::String(String::from_utf8_lossy(raw).into_owned());
    }

    // Unknown type: try JSON, then text, then base64.
    if let Ok(parsed) = serde_json::from_slice::<Value>(raw) {
        return parsed;
    }

    let text = String::from_utf8_lossy(raw);
    if text.contains('\u{fffd}') {
        return base64_record(raw);
    }
    Value::String(text.into_owned())
}

/// Reverses [`parse_body`], producing raw bytes suitable for HTTP transport.
///
/// A `{data, encoding}` record yields the decoded payload; anything else is
/// re-serialized as JSON. Null bodies decode to an empty byte string.
pub fn decode_body(body: &Value) -> anyhow::Result<Vec<u8>> {
    if body.is_null() {
        return Ok(Vec::new());
    }

    if let Value::Object(map) = body {
        if let Some(encoding) = map.get("encoding").and_then(Value::as_str) {
            let data = map.get("data").and_then(Value::as_str).unwrap_or_default();
            match encoding {
                ENCODING_BASE64 => {
                    return BASE64.decode(data).context("decode base64 body data");
                }
                ENCODING_TEXT => return Ok(data.as_bytes().to_vec()),
                _ => {}
            }
        }
    }

    serde_json::to_vec(body).context("serialize body as JSON")
}

fn base64_record(raw: &[u8]) -> Value {
    let mut record = Map::new();
    record.insert("data".to_owned(), json!(BASE64.encode(raw)));
    record.insert("encoding".to_owned(), json!(ENCODING_BASE64));
    Value::Object(record)
}

fn is_binary_content_type(ct: &str) -> bool {
    BINARY_CONTENT_TYPES
        .iter()
        .any(|binary| ct.starts_with(binary))
}

fn is_json_content_type(ct: &str) -> bool {
    ct.contains("json") || ct.contains("json-rpc")
}

fn is_text_content_type(ct: &str) -> bool {
    ct.starts_with("text/")
        || ct.contains("xml")
        || ct.contains("html")
        || ct.contains("form-urlencoded")
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{decode_body, parse_body};

    #[test]
    fn json_body_parses_into_structured_value() {
        let parsed = parse_body(br#"{"id":1,"name":"Alice"}"#, "application/json");
        assert_eq!(parsed, json!({"id": 1, "name": "Alice"}));
    }

    #[test]
    fn json_content_type_with_charset_still_parses() {
        let parsed = parse_body(br#"[1,2,3]"#, "application/json; charset=utf-8");
        assert_eq!(parsed, json!([1, 2, 3]));
    }

    #[test]
    fn empty_body_round_trips_as_null() {
        let parsed = parse_body(b"", "application/json");
        assert_eq!(parsed, Value::Null);
        assert_eq!(decode_body(&parsed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn binary_content_type_wraps_bytes_in_base64_record() {
        let raw = [0x00u8, 0x01, 0x80, 0xff];
        let parsed = parse_body(&raw, "application/protobuf");
        assert_eq!(parsed["encoding"], json!("base64"));
        assert_eq!(decode_body(&parsed).unwrap(), raw);
    }

    #[test]
    fn grpc_content_type_with_suffix_is_binary() {
        let raw = [0x0au8, 0x03, 0x66, 0x6f, 0x6f];
        let parsed = parse_body(&raw, "application/grpc+proto");
        assert_eq!(parsed["encoding"], json!("base64"));
        assert_eq!(decode_body(&parsed).unwrap(), raw);
    }

    #[test]
    fn text_content_type_stores_string() {
        let parsed = parse_body(b"hello world", "text/plain");
        assert_eq!(parsed, json!("hello world"));
        assert_eq!(decode_body(&parsed).unwrap(), b"\"hello world\"");
    }

    #[test]
    fn malformed_json_with_json_content_type_falls_through_to_string() {
        let parsed = parse_body(b"not json {", "application/json");
        assert_eq!(parsed, json!("not json {"));
    }

    #[test]
    fn unknown_content_type_tries_json_first() {
        let parsed = parse_body(br#"{"a":true}"#, "application/whatever");
        assert_eq!(parsed, json!({"a": true}));
    }

    #[test]
    fn unknown_content_type_with_invalid_utf8_falls_back_to_base64() {
        let raw = [0xffu8, 0xfe, 0x00, 0x80];
        let parsed = parse_body(&raw, "application/whatever");
        assert_eq!(parsed["encoding"], json!("base64"));
        assert_eq!(decode_body(&parsed).unwrap(), raw);
    }

    #[test]
    fn structured_body_decodes_to_compact_json() {
        let body = json!({"b": 2, "a": 1});
        let decoded = decode_body(&body).unwrap();
        let reparsed: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(reparsed, body);
    }

    #[test]
    fn text_record_decodes_to_raw_bytes() {
        let body = json!({"data": "plain text", "encoding": "text"});
        assert_eq!(decode_body(&body).unwrap(), b"plain text");
    }

    #[test]
    fn malformed_base64_fails_decoding() {
        let body = json!({"data": "!!!not base64!!!", "encoding": "base64"});
        assert!(decode_body(&body).is_err());
    }

    #[test]
    fn form_urlencoded_is_text() {
        let parsed = parse_body(b"a=1&b=2", "application/x-www-form-urlencoded");
        assert_eq!(parsed, json!("a=1&b=2"));
    }
}
