//! `$util.dynamodb`: conversion of plain values into typed attribute values.

use serde_json::{json, Map, Number, Value};

use crate::{
    methods::{arg, string_arg},
    value::NativeObject,
    Adapt, RenderError, TemplateValue,
};

#[derive(Debug, thiserror::Error)]
pub enum DynamoDbError {
    #[error("`{0}` is not a number")]
    NotANumber(String),
    #[error("{method} expects {expected}")]
    UnexpectedInput {
        method: &'static str,
        expected: &'static str,
    },
    #[error("invalid S3 object: {0}")]
    S3Object(String),
}

impl From<DynamoDbError> for RenderError {
    fn from(error: DynamoDbError) -> Self {
        RenderError::Evaluation(error.to_string())
    }
}

/// Infers the attribute type from the shape of `value`.
pub fn to_dynamodb(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "NULL": true }),
        Value::Bool(b) => json!({ "BOOL": b }),
        Value::Number(n) => json!({ "N": n.to_string() }),
        Value::String(s) => json!({ "S": s }),
        Value::Array(items) => json!({ "L": items.iter().map(to_dynamodb).collect::<Vec<_>>() }),
        Value::Object(fields) => json!({ "M": to_map_values(fields) }),
    }
}

fn to_map_values(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(key, value)| (key.clone(), to_dynamodb(value)))
        .collect()
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number_text(value: &Value) -> Result<String, DynamoDbError> {
    match value {
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .map(Number::from)
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(Number::from_f64))
                .map(|n| n.to_string())
                .ok_or_else(|| DynamoDbError::NotANumber(s.clone()))
        }
        other => Err(DynamoDbError::NotANumber(other.to_string())),
    }
}

/// A single value counts as a one element set.
fn items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        single => vec![single],
    }
}

fn s3_object(key: String, bucket: String, region: String, version: Option<String>) -> Value {
    let mut s3 = json!({ "key": key, "bucket": bucket, "region": region });
    if let (Some(version), Some(fields)) = (version, s3.as_object_mut()) {
        fields.insert("version".to_string(), Value::String(version));
    }
    json!({ "S": json!({ "s3": s3 }).to_string() })
}

fn from_s3_object_json(source: &str) -> Result<Value, DynamoDbError> {
    let parsed: Value = serde_json::from_str(source).map_err(|error| DynamoDbError::S3Object(error.to_string()))?;

    match parsed.get("s3") {
        Some(s3 @ Value::Object(_)) => Ok(s3.clone()),
        _ => Err(DynamoDbError::S3Object("missing `s3` object".to_string())),
    }
}

/// `$util.dynamodb`
pub(super) struct DynamoDbUtil;

impl DynamoDbUtil {
    fn convert(method: &str, args: &[TemplateValue]) -> Result<Value, RenderError> {
        let input = arg(args, 0).to_json();

        let value = match method {
            "toDynamoDB" => to_dynamodb(&input),
            "toString" => json!({ "S": text(&input) }),
            "toStringSet" => json!({ "SS": items(input).iter().map(text).collect::<Vec<_>>() }),
            "toNumber" => json!({ "N": number_text(&input)? }),
            "toNumberSet" => json!({
                "NS": items(input).iter().map(number_text).collect::<Result<Vec<_>, _>>()?
            }),
            "toBinary" => json!({ "B": input }),
            "toBinarySet" => json!({ "BS": items(input) }),
            "toBoolean" => json!({ "BOOL": input }),
            "toNull" => json!({ "NULL": true }),
            "toList" => match input {
                Value::Array(_) => to_dynamodb(&input),
                _ => {
                    return Err(DynamoDbError::UnexpectedInput {
                        method: "toList",
                        expected: "a list",
                    }
                    .into())
                }
            },
            "toMap" => match input {
                Value::Object(_) => to_dynamodb(&input),
                _ => {
                    return Err(DynamoDbError::UnexpectedInput {
                        method: "toMap",
                        expected: "a map",
                    }
                    .into())
                }
            },
            "toMapValues" => match &input {
                Value::Object(fields) => Value::Object(to_map_values(fields)),
                _ => {
                    return Err(DynamoDbError::UnexpectedInput {
                        method: "toMapValues",
                        expected: "a map",
                    }
                    .into())
                }
            },
            "toS3Object" => {
                let version = Some(arg(args, 3))
                    .filter(|version| !version.is_null_or_undefined())
                    .map(|version| version.to_string());
                s3_object(string_arg(args, 0)?, string_arg(args, 1)?, string_arg(args, 2)?, version)
            }
            "fromS3ObjectJson" => from_s3_object_json(&string_arg(args, 0)?)?,
            _ => return Err(RenderError::unsupported("util.dynamodb", method)),
        };

        Ok(value)
    }
}

impl NativeObject for DynamoDbUtil {
    fn type_name(&self) -> &'static str {
        "util.dynamodb"
    }

    /// Every `toX` has a `toXJson` twin returning the serialized attribute.
    fn call(&self, method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError> {
        match method.strip_suffix("Json") {
            Some(base) if method != "fromS3ObjectJson" => Ok(Self::convert(base, args)?.to_string().into()),
            _ => Ok(Self::convert(method, args)?.adapt()),
        }
    }
}
