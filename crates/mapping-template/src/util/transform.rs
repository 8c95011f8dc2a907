use serde_json::{json, Map, Value};

use super::dynamodb::to_dynamodb;
use crate::{methods::arg, value::NativeObject, Adapt, RenderError, TemplateValue};

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("a filter must be a map")]
    NotAMap,
    #[error("`{0}` expects a list of filters")]
    ExpectedList(String),
    #[error("conditions on `{0}` must be a map of operators")]
    ExpectedConditions(String),
    #[error("`between` on `{0}` expects a list of two values")]
    Between(String),
}

impl From<FilterError> for RenderError {
    fn from(error: FilterError) -> Self {
        RenderError::Evaluation(error.to_string())
    }
}

/// Turns `{field: {op: value}}` filters, optionally combined with `and`, `or` and `not`,
/// into a DynamoDB filter expression with its placeholder maps.
pub fn to_dynamodb_filter_expression(filter: &Value) -> Result<Value, FilterError> {
    let mut builder = Builder::default();
    let expression = builder.filter(filter)?;

    Ok(json!({
        "expression": expression,
        "expressionNames": builder.names,
        "expressionValues": builder.values,
    }))
}

#[derive(Default)]
struct Builder {
    names: Map<String, Value>,
    values: Map<String, Value>,
}

impl Builder {
    fn filter(&mut self, filter: &Value) -> Result<String, FilterError> {
        let Value::Object(fields) = filter else {
            return Err(FilterError::NotAMap);
        };

        let mut parts = Vec::new();
        for (key, value) in fields {
            match key.as_str() {
                "and" | "or" => {
                    let Value::Array(filters) = value else {
                        return Err(FilterError::ExpectedList(key.clone()));
                    };
                    let separator = if key == "and" { " AND " } else { " OR " };
                    let nested = filters
                        .iter()
                        .map(|filter| self.filter(filter))
                        .collect::<Result<Vec<_>, _>>()?;
                    parts.push(format!("({})", nested.join(separator)));
                }
                "not" => parts.push(format!("(NOT {})", self.filter(value)?)),
                field => {
                    let Value::Object(conditions) = value else {
                        return Err(FilterError::ExpectedConditions(field.to_string()));
                    };
                    for (op, operand) in conditions {
                        parts.push(self.condition(field, op, operand)?);
                    }
                }
            }
        }

        Ok(parts.join(" AND "))
    }

    fn condition(&mut self, field: &str, op: &str, operand: &Value) -> Result<String, FilterError> {
        let placeholder = field.replace(' ', "_");
        let name = format!("#{placeholder}");
        self.names.insert(name.clone(), Value::String(field.to_string()));

        let symbol = match op {
            "eq" => Some("="),
            "ne" => Some("<>"),
            "lt" => Some("<"),
            "le" => Some("<="),
            "gt" => Some(">"),
            "ge" => Some(">="),
            _ => None,
        };

        if let Some(symbol) = symbol {
            let value = self.value(format!(":{placeholder}_{op}"), operand);
            return Ok(format!("({name} {symbol} {value})"));
        }

        if op == "between" {
            let Some([low, high]) = operand.as_array().and_then(|bounds| <&[Value; 2]>::try_from(bounds.as_slice()).ok())
            else {
                return Err(FilterError::Between(field.to_string()));
            };

            let low_value = self.value(format!(":{placeholder}_between_0"), low);
            let high_value = self.value(format!(":{placeholder}_between_1"), high);
            return Ok(format!("({name} BETWEEN {low_value} AND {high_value})"));
        }

        let function = match op {
            "beginsWith" => "begins_with",
            "notContains" => "NOT contains",
            other => other,
        };
        let value = self.value(format!(":{placeholder}_{op}"), operand);

        Ok(format!("({function}({name}, {value}))"))
    }

    /// Binds `operand` to a value placeholder. Names are shared between conditions on the same
    /// field, values never are: a taken `base` gets the first free numeric suffix.
    fn value(&mut self, base: String, operand: &Value) -> String {
        let placeholder = if self.values.contains_key(&base) {
            (1..)
                .map(|n| format!("{base}_{n}"))
                .find(|candidate| !self.values.contains_key(candidate))
                .unwrap_or(base)
        } else {
            base
        };

        self.values.insert(placeholder.clone(), to_dynamodb(operand));
        placeholder
    }
}

/// `$util.transform`
pub(super) struct TransformUtil;

impl NativeObject for TransformUtil {
    fn type_name(&self) -> &'static str {
        "util.transform"
    }

    fn call(&self, method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError> {
        match method {
            "toDynamoDBFilterExpression" => Ok(to_dynamodb_filter_expression(&arg(args, 0).to_json())?.adapt()),
            _ => Err(RenderError::unsupported("util.transform", method)),
        }
    }
}
