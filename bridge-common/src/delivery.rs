use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A header value as carried on a delivery.
///
/// Broker clients map their native field tables onto this; JSON `context`
/// objects from pipeline envelopes deserialize straight into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    /// The string content, for text values only.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HeaderValue::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Text(s.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Text(s)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// One message as received from the broker.
///
/// A delivery is created on receive and terminated by exactly one broker
/// action: ack, nack-requeue or nack-drop. The worker owning the delivery is
/// responsible for issuing that action; nothing here talks to the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Bytes,
    pub headers: Headers,
    pub redelivered: bool,
    /// Broker-scoped identifier used for ack/nack.
    pub delivery_tag: u64,
    pub content_type: Option<String>,
}

impl Delivery {
    /// Read a text-valued header, if present.
    pub fn text_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(HeaderValue::as_text)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<HeaderValue>) {
        self.headers.insert(name.to_owned(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<HeaderValue> {
        self.headers.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_value_deserializes_untagged() {
        let headers: Headers =
            serde_json::from_str(r#"{"a": "text", "b": 42, "c": true, "d": [1, 2]}"#).unwrap();

        assert_eq!(headers.get("a"), Some(&HeaderValue::Text("text".into())));
        assert_eq!(headers.get("b"), Some(&HeaderValue::Int(42)));
        assert_eq!(headers.get("c"), Some(&HeaderValue::Bool(true)));
        assert_eq!(headers.get("d"), Some(&HeaderValue::Bytes(vec![1, 2])));
    }

    #[test]
    fn text_header_ignores_non_text_values() {
        let mut delivery = Delivery {
            routing_key: "lo.update".to_owned(),
            body: Bytes::new(),
            headers: Headers::new(),
            redelivered: false,
            delivery_tag: 1,
            content_type: None,
        };
        delivery.set_header("X-VERSION", "v1.0.0");
        delivery.headers.insert("X-PRIORITY".to_owned(), HeaderValue::Int(3));

        assert_eq!(delivery.text_header("X-VERSION"), Some("v1.0.0"));
        assert_eq!(delivery.text_header("X-PRIORITY"), None);
        assert_eq!(delivery.text_header("X-MISSING"), None);
    }
}
