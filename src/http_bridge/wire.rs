//! Request/response messages exchanged on the `http/request` and
//! `http/response` topics.

use crate::http_bridge::BridgeError;
use http::Method;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Status published when the bridge could not process a request. Outside
/// the range of real HTTP status codes.
pub const INVALID_RESPONSE_CODE: u16 = 999;

/// A validated HTTP call request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpCallRequest {
    pub id: String,
    pub url: Url,
    pub method: Method,
    pub body: Value,
}

impl HttpCallRequest {
    /// Whether the body travels as the request payload rather than as
    /// query parameters.
    pub fn sends_body(&self) -> bool {
        method_sends_body(&self.method)
    }

    /// The target URL with an object body appended as query parameters,
    /// after any query the URL already has.
    pub fn url_with_query(&self) -> Url {
        let mut url = self.url.clone();
        if let Value::Object(fields) = &self.body {
            if !fields.is_empty() {
                let mut pairs = url.query_pairs_mut();
                for (key, value) in fields {
                    pairs.append_pair(key, &query_value(value));
                }
            }
        }
        url
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpCallResponse {
    pub id: String,
    pub status: u16,
    pub body: Value,
}

impl HttpCallResponse {
    pub fn invalid(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: INVALID_RESPONSE_CODE,
            body: json!({}),
        }
    }
}

/// Outcome of decoding and validating one inbound payload.
#[derive(Debug, PartialEq)]
pub enum DecodedRequest {
    Valid(HttpCallRequest),
    /// `id` is the request's id when it had a usable one, else empty.
    Malformed { id: String, error: BridgeError },
}

/// Decodes and validates a request payload. Never fails: anything that is
/// not a well-formed call becomes `Malformed`.
pub fn decode_request(payload: &[u8]) -> DecodedRequest {
    let fields = match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(fields)) => fields,
        Ok(_) => {
            return DecodedRequest::Malformed {
                id: String::new(),
                error: BridgeError::InvalidJson("request is not a JSON object".to_string()),
            }
        }
        Err(e) => {
            return DecodedRequest::Malformed {
                id: String::new(),
                error: BridgeError::InvalidJson(e.to_string()),
            }
        }
    };

    let id = fields.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
    match validate(&fields) {
        Ok(request) => DecodedRequest::Valid(request),
        Err(error) => DecodedRequest::Malformed { id, error },
    }
}

fn validate(fields: &Map<String, Value>) -> Result<HttpCallRequest, BridgeError> {
    let id = required_str(fields, "id")?;
    let url = parse_url(required_str(fields, "url")?)?;
    let method = parse_method(required_str(fields, "method")?)?;
    let body = fields
        .get("body")
        .cloned()
        .ok_or(BridgeError::MissingField("body"))?;

    if !method_sends_body(&method) && !body.is_object() {
        return Err(BridgeError::InvalidBody(format!(
            "{} body must be an object of query parameters",
            method
        )));
    }

    Ok(HttpCallRequest {
        id: id.to_string(),
        url,
        method,
        body,
    })
}

fn required_str<'a>(fields: &'a Map<String, Value>, name: &'static str) -> Result<&'a str, BridgeError> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .ok_or(BridgeError::MissingField(name))
}

pub fn parse_url(raw: &str) -> Result<Url, BridgeError> {
    let url = Url::parse(raw).map_err(|e| BridgeError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        "http" | "https" => Err(BridgeError::InvalidUrl(format!("{}: missing host", raw))),
        scheme => Err(BridgeError::InvalidUrl(format!("unsupported scheme '{}'", scheme))),
    }
}

pub fn parse_method(raw: &str) -> Result<Method, BridgeError> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "HEAD" => Ok(Method::HEAD),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        "OPTIONS" => Ok(Method::OPTIONS),
        _ => Err(BridgeError::UnsupportedMethod(raw.to_string())),
    }
}

fn method_sends_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Maps a downstream reply body onto the response `body` field.
pub fn response_body(status: u16, bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return if (300..400).contains(&status) {
            Value::String(String::new())
        } else {
            json!({})
        };
    }

    match serde_json::from_slice::<Value>(bytes) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
        _ => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}
