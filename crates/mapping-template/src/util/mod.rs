//! The `$util` namespace available to every template.
//!
//! One instance lives for a whole field resolution: it owns the ordered list of errors
//! reported by templates and the instant the resolution started, so the request and the
//! response template observe the same "now".

mod dynamodb;
mod text;
mod time;
mod transform;

use std::{cell::RefCell, rc::Rc};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    methods::{self, arg, list_arg, string_arg},
    value::{MapValue, NativeObject, Scalar},
    Adapt, Context, ErrorKind, RenderError, ResolverError, TemplateValue,
};

pub use self::{
    dynamodb::{to_dynamodb, DynamoDbError},
    time::{java_format_to_chrono, TimeError},
    transform::{to_dynamodb_filter_expression, FilterError},
};

#[derive(Clone)]
pub struct Util {
    state: Rc<State>,
}

struct State {
    errors: RefCell<Vec<ResolverError>>,
    now: DateTime<Utc>,
}

impl Util {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_errors(now, Vec::new())
    }

    /// Continues a resolution that already collected `errors` in an earlier render.
    pub fn with_errors(now: DateTime<Utc>, errors: Vec<ResolverError>) -> Self {
        Util {
            state: Rc::new(State {
                errors: RefCell::new(errors),
                now,
            }),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state.now
    }

    pub fn errors(&self) -> Vec<ResolverError> {
        self.state.errors.borrow().clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.state.errors.borrow().is_empty()
    }

    /// Makes the namespace visible as both `$util` and `$utils`.
    pub fn install(&self, context: &mut Context) {
        context.insert("util", TemplateValue::native(self.clone()));
        context.insert("utils", TemplateValue::native(self.clone()));
    }

    fn push(&self, error: ResolverError) {
        tracing::debug!(kind = %error.kind, message = %error.message, "template reported an error");
        self.state.errors.borrow_mut().push(error);
    }

    fn raise(&self, error: ResolverError) -> Result<TemplateValue, RenderError> {
        self.push(error.clone());
        Err(RenderError::Raised(error))
    }
}

impl NativeObject for Util {
    fn type_name(&self) -> &'static str {
        "util"
    }

    fn property(&self, name: &str) -> Option<TemplateValue> {
        let namespace = match name {
            "time" => TemplateValue::native(time::TimeUtil::new(self.state.now)),
            "list" => TemplateValue::native(ListUtil),
            "map" => TemplateValue::native(MapUtil),
            "dynamodb" => TemplateValue::native(dynamodb::DynamoDbUtil),
            "transform" => TemplateValue::native(transform::TransformUtil),
            _ => return None,
        };
        Some(namespace)
    }

    fn call(&self, method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError> {
        let value: TemplateValue = match method {
            "qr" | "quiet" => "".into(),
            "escapeJavaScript" => text::escape_javascript(&string_arg(args, 0)?).into(),
            "urlEncode" => text::url_encode(&string_arg(args, 0)?).into(),
            "urlDecode" => text::url_decode(&string_arg(args, 0)?)?.into(),
            "base64Encode" => text::base64_encode(&string_arg(args, 0)?).into(),
            "base64Decode" => text::base64_decode(&string_arg(args, 0)?)?.into(),
            "parseJson" => {
                let source = string_arg(args, 0)?;
                serde_json::from_str::<Value>(&source)
                    .map_err(|error| RenderError::evaluation(format!("parseJson: {error}")))?
                    .adapt()
            }
            "toJson" => arg(args, 0).to_json().to_string().into(),
            "autoId" => uuid::Uuid::new_v4().to_string().into(),
            "unauthorized" => return self.raise(ResolverError::unauthorized()),
            "error" => return self.raise(reported_error(ErrorKind::Reported, args)),
            "appendError" => {
                self.push(reported_error(ErrorKind::Reported, args));
                "".into()
            }
            "getErrors" => self
                .errors()
                .iter()
                .map(|error| error.to_json().adapt())
                .collect::<Vec<_>>()
                .into(),
            "validate" => {
                if arg(args, 0).is_truthy() {
                    "".into()
                } else {
                    return self.raise(reported_error(ErrorKind::Validation, &args[args.len().min(1)..]));
                }
            }
            "isNull" => arg(args, 0).is_null_or_undefined().into(),
            "isNullOrEmpty" => is_null_or(&arg(args, 0), str::is_empty).into(),
            "isNullOrBlank" => is_null_or(&arg(args, 0), |s| s.trim().is_empty()).into(),
            "defaultIfNull" => {
                let value = arg(args, 0);
                if value.is_null_or_undefined() {
                    arg(args, 1)
                } else {
                    value
                }
            }
            "defaultIfNullOrEmpty" => {
                let value = arg(args, 0);
                if is_null_or(&value, str::is_empty) {
                    arg(args, 1)
                } else {
                    value
                }
            }
            "defaultIfNullOrBlank" => {
                let value = arg(args, 0);
                if is_null_or(&value, |s| s.trim().is_empty()) {
                    arg(args, 1)
                } else {
                    value
                }
            }
            "isString" => matches!(arg(args, 0), TemplateValue::String(_)).into(),
            "isNumber" => matches!(arg(args, 0), TemplateValue::Scalar(Scalar::Number(_))).into(),
            "isBoolean" => matches!(arg(args, 0), TemplateValue::Scalar(Scalar::Bool(_))).into(),
            "isList" => matches!(arg(args, 0), TemplateValue::List(_)).into(),
            "isMap" => matches!(arg(args, 0), TemplateValue::Map(_)).into(),
            "typeOf" => type_of(&arg(args, 0)).into(),
            "matches" => methods::full_match(&string_arg(args, 0)?, &string_arg(args, 1)?)?.into(),
            _ => return Err(RenderError::unsupported("util", method)),
        };

        Ok(value)
    }
}

/// Builds an error from the `(message, errorType, data, errorInfo)` argument convention.
fn reported_error(kind: ErrorKind, args: &[TemplateValue]) -> ResolverError {
    let message = arg(args, 0);
    let message = if message.is_null_or_undefined() {
        String::new()
    } else {
        message.to_string()
    };

    let error_type = Some(arg(args, 1))
        .filter(|error_type| !error_type.is_null_or_undefined())
        .map(|error_type| error_type.to_string());

    ResolverError::new(kind, message)
        .with_error_type(error_type)
        .with_data(arg(args, 2).to_json())
        .with_error_info(arg(args, 3).to_json())
}

fn is_null_or(value: &TemplateValue, predicate: impl Fn(&str) -> bool) -> bool {
    value.is_null_or_undefined() || value.as_str().is_some_and(predicate)
}

fn type_of(value: &TemplateValue) -> &'static str {
    match value {
        TemplateValue::Scalar(Scalar::Null) => "Null",
        TemplateValue::Scalar(Scalar::Number(_)) => "Number",
        TemplateValue::Scalar(Scalar::Bool(_)) => "Boolean",
        TemplateValue::String(_) => "String",
        TemplateValue::List(_) => "List",
        TemplateValue::Map(_) => "Map",
        TemplateValue::Undefined | TemplateValue::Native(_) => "Object",
    }
}

/// `$util.list`
struct ListUtil;

impl NativeObject for ListUtil {
    fn type_name(&self) -> &'static str {
        "util.list"
    }

    fn call(&self, method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError> {
        let retain = match method {
            "copyAndRetainAll" => true,
            "copyAndRemoveAll" => false,
            _ => return Err(RenderError::unsupported("util.list", method)),
        };

        let filter = list_arg(args, 1)?;
        let copy: Vec<TemplateValue> = list_arg(args, 0)?
            .into_iter()
            .filter(|item| filter.contains(item) == retain)
            .collect();

        Ok(copy.into())
    }
}

/// `$util.map`
struct MapUtil;

impl NativeObject for MapUtil {
    fn type_name(&self) -> &'static str {
        "util.map"
    }

    fn call(&self, method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError> {
        let retain = match method {
            "copyAndRetainAllKeys" => true,
            "copyAndRemoveAllKeys" => false,
            _ => return Err(RenderError::unsupported("util.map", method)),
        };

        let source = arg(args, 0);
        let source = source
            .as_map()
            .ok_or_else(|| RenderError::evaluation(format!("{method} expects a map")))?;
        let keys: Vec<String> = match args.get(1) {
            Some(_) => list_arg(args, 1)?.iter().map(ToString::to_string).collect(),
            None => Vec::new(),
        };

        let copy = MapValue::default();
        for (key, value) in source.entries() {
            if keys.contains(&key) == retain {
                copy.insert(key, value);
            }
        }

        Ok(copy.into())
    }
}
