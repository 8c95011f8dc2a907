use serde_json::{Map, Value};

/// Whether a subscription payload goes out to the client that registered with `variables`.
///
/// Payloads without data never do. With variables, the value of the single root field must
/// carry every variable with an equal value.
pub fn should_publish(payload: &Value, variables: &Map<String, Value>) -> bool {
    let Some(data) = payload.get("data").filter(|data| !data.is_null()) else {
        return false;
    };

    if variables.is_empty() {
        return true;
    }

    let Some(fields) = data.as_object() else {
        return false;
    };

    let mut values = fields.values();
    let (Some(value), None) = (values.next(), values.next()) else {
        return false;
    };

    variables.iter().all(|(name, expected)| value.get(name) == Some(expected))
}
