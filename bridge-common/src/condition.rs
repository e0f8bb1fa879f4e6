use serde::Deserialize;
use serde_json::Value;

use crate::delivery::Delivery;

/// A route condition: a tree of predicates evaluated against one delivery.
///
/// Evaluation is pure and fail-closed: an unknown operator, a missing header
/// or an unparseable document makes the node evaluate to `false` rather than
/// erroring out. Operators stay raw strings so a typo in a config file cannot
/// take the consumer down at parse time.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Condition {
    And {
        and: Vec<Condition>,
    },
    Or {
        or: Vec<Condition>,
    },
    Not {
        not: Box<Condition>,
    },
    Text {
        text: TextMatch,
    },
    #[serde(alias = "gjson")]
    Json {
        #[serde(alias = "gjson")]
        json: JsonMatch,
    },
}

/// String predicate over a selected part of the delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct TextMatch {
    /// `body`, or `headers.<name>`.
    pub part: String,
    /// `match`, `startsWith`, `endsWith`, `contains`.
    pub op: String,
    pub arg: String,
}

/// Predicate over a JSON query result inside a selected part.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonMatch {
    pub part: String,
    /// Dot path into the JSON document, e.g. `payload.type`.
    pub query: String,
    /// String ops as in [`TextMatch`]; numeric ops `equal`, `greaterThan`,
    /// `greaterThanOrEqual`, `lessThan`, `lessThanOrEqual`.
    pub op: String,
    pub arg: String,
}

impl Condition {
    pub fn evaluate(&self, delivery: &Delivery) -> bool {
        match self {
            Condition::And { and } => and.iter().all(|c| c.evaluate(delivery)),
            Condition::Or { or } => or.iter().any(|c| c.evaluate(delivery)),
            Condition::Not { not } => !not.evaluate(delivery),
            Condition::Text { text } => text.evaluate(delivery),
            Condition::Json { json } => json.evaluate(delivery),
        }
    }
}

impl TextMatch {
    fn evaluate(&self, delivery: &Delivery) -> bool {
        let subject = String::from_utf8_lossy(&part(delivery, &self.part)).into_owned();
        text_op(&self.op, &subject, &self.arg)
    }
}

impl JsonMatch {
    fn evaluate(&self, delivery: &Delivery) -> bool {
        let subject = part(delivery, &self.part);
        let document: Value = serde_json::from_slice(&subject).unwrap_or(Value::Null);
        let result = lookup(&document, &self.query);

        match self.op.as_str() {
            "match" | "startsWith" | "endsWith" | "contains" => {
                text_op(&self.op, &text_of(result), &self.arg)
            }
            "equal" => int_of(result) == self.arg_int(),
            "greaterThan" => int_of(result) > self.arg_int(),
            // The misspelled forms ship in existing config files.
            "greaterThanOrEqual" | "greaterThanOrEequal" => int_of(result) >= self.arg_int(),
            "lessThan" => int_of(result) < self.arg_int(),
            "lessThanOrEqual" | "lessThanOrEequal" => int_of(result) <= self.arg_int(),
            _ => false,
        }
    }

    fn arg_int(&self) -> i64 {
        self.arg.parse().unwrap_or(0)
    }
}

/// Select the subject bytes for a predicate: the body, or one text header.
fn part(delivery: &Delivery, part: &str) -> Vec<u8> {
    if part == "body" {
        return delivery.body.to_vec();
    }

    if let Some(name) = part.strip_prefix("headers.") {
        if let Some(value) = delivery.text_header(name) {
            return value.as_bytes().to_vec();
        }
    }

    Vec::new()
}

fn text_op(op: &str, subject: &str, arg: &str) -> bool {
    match op {
        "match" => subject == arg,
        "startsWith" => subject.starts_with(arg),
        "endsWith" => subject.ends_with(arg),
        "contains" => subject.contains(arg),
        _ => false,
    }
}

/// Resolve a dot path against a JSON document. Array segments index by
/// position.
fn lookup<'a>(document: &'a Value, query: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in query.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn int_of(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_else(|| {
            n.as_f64().map(|f| f as i64).unwrap_or(0)
        }),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Bool(true)) => 1,
        _ => 0,
    }
}
