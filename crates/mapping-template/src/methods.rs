//! The Java method surfaces of [`TemplateValue`] variants.

use regex::Regex;

use crate::{
    value::{ListValue, MapValue, Scalar, StringValue},
    RenderError, TemplateValue,
};

/// Resolves `$target.name`.
///
/// Maps look the key up through the same path as `get`. Other values fall back to bean
/// getters, so `$list.empty` is `$list.isEmpty()`.
pub(crate) fn property(target: &TemplateValue, name: &str) -> Result<TemplateValue, RenderError> {
    match target {
        TemplateValue::Map(map) => Ok(map.get(name)),
        TemplateValue::Native(native) => Ok(native.property_of(name).unwrap_or_default()),
        TemplateValue::Undefined | TemplateValue::Scalar(Scalar::Null) => Ok(TemplateValue::Undefined),
        other => {
            let capitalized = capitalize(name);
            for getter in [format!("get{capitalized}"), format!("is{capitalized}"), name.to_string()] {
                match call(other, &getter, &[]) {
                    Err(RenderError::UnsupportedMethod { .. }) => continue,
                    result => return result,
                }
            }
            Ok(TemplateValue::Undefined)
        }
    }
}

/// Resolves `$target[index]`.
pub(crate) fn index(target: &TemplateValue, index: &TemplateValue) -> Result<TemplateValue, RenderError> {
    match target {
        TemplateValue::Map(map) => Ok(map.get(&index.to_string())),
        TemplateValue::List(list) => {
            let position = list_index(index, list.len())?;
            Ok(list.get(position).unwrap_or_default())
        }
        TemplateValue::Undefined | TemplateValue::Scalar(Scalar::Null) => Ok(TemplateValue::Undefined),
        other => Err(RenderError::evaluation(format!("cannot index into a {}", other.type_name()))),
    }
}

/// Resolves `$target.method(args)`.
pub(crate) fn call(target: &TemplateValue, method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError> {
    match target {
        TemplateValue::String(s) => string_method(s, method, args),
        TemplateValue::List(list) => list_method(list, method, args),
        TemplateValue::Map(map) => map_method(map, method, args),
        TemplateValue::Native(native) => native.call(method, args),
        TemplateValue::Scalar(Scalar::Bool(_) | Scalar::Number(_)) => match method {
            "toString" => Ok(target.to_string().into()),
            "equals" => Ok((arg(args, 0) == *target).into()),
            _ => Err(RenderError::unsupported(target.type_name(), method)),
        },
        TemplateValue::Undefined | TemplateValue::Scalar(Scalar::Null) => Ok(TemplateValue::Undefined),
    }
}

fn string_method(s: &StringValue, method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError> {
    let text = s.as_str();

    let value: TemplateValue = match method {
        "length" | "size" => text.chars().count().into(),
        "isEmpty" => text.is_empty().into(),
        "contains" => text.contains(string_arg(args, 0)?.as_str()).into(),
        "startsWith" => text.starts_with(string_arg(args, 0)?.as_str()).into(),
        "endsWith" => text.ends_with(string_arg(args, 0)?.as_str()).into(),
        "equals" => (arg(args, 0).as_str() == Some(text)).into(),
        "equalsIgnoreCase" => arg(args, 0)
            .as_str()
            .is_some_and(|other| other.to_lowercase() == text.to_lowercase())
            .into(),
        "toLowerCase" => text.to_lowercase().into(),
        "toUpperCase" => text.to_uppercase().into(),
        "trim" => text.trim().into(),
        "toString" | "toJSON" => TemplateValue::String(s.clone()),
        "concat" => format!("{text}{}", string_arg(args, 0)?).into(),
        "charAt" => {
            let position = usize_arg(args, 0)?;
            text.chars()
                .nth(position)
                .map(|c| TemplateValue::from(c.to_string()))
                .ok_or_else(|| RenderError::evaluation(format!("string index out of range: {position}")))?
        }
        "indexOf" => char_position(text, text.find(string_arg(args, 0)?.as_str())),
        "lastIndexOf" => char_position(text, text.rfind(string_arg(args, 0)?.as_str())),
        "substring" => {
            let chars: Vec<char> = text.chars().collect();
            let start = usize_arg(args, 0)?;
            let end = if args.len() > 1 { usize_arg(args, 1)? } else { chars.len() };
            if start > end || end > chars.len() {
                return Err(RenderError::evaluation(format!(
                    "substring range {start}..{end} out of bounds for length {}",
                    chars.len()
                )));
            }
            chars[start..end].iter().collect::<String>().into()
        }
        "replace" => text
            .replace(string_arg(args, 0)?.as_str(), string_arg(args, 1)?.as_str())
            .into(),
        "replaceAll" => {
            let regex = compile(&string_arg(args, 0)?)?;
            let replacement = java_replacement(&string_arg(args, 1)?);
            regex.replace_all(text, replacement.as_str()).into_owned().into()
        }
        "replaceFirst" => {
            let regex = compile(&string_arg(args, 0)?)?;
            let replacement = java_replacement(&string_arg(args, 1)?);
            regex.replace(text, replacement.as_str()).into_owned().into()
        }
        "matches" => full_match(&string_arg(args, 0)?, text)?.into(),
        "split" => split(text, &string_arg(args, 0)?)?
            .into_iter()
            .map(TemplateValue::from)
            .collect::<Vec<_>>()
            .into(),
        _ => return Err(RenderError::unsupported("string", method)),
    };

    Ok(value)
}

fn list_method(list: &ListValue, method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError> {
    let value: TemplateValue = match method {
        "size" => list.len().into(),
        "isEmpty" => list.is_empty().into(),
        "get" => {
            let position = list_index(&arg(args, 0), list.len())?;
            list.get(position)
                .ok_or_else(|| RenderError::evaluation(format!("index {position} out of bounds")))?
        }
        "set" => {
            let position = list_index(&arg(args, 0), list.len())?;
            list.set(position, arg(args, 1))
                .ok_or_else(|| RenderError::evaluation(format!("index {position} out of bounds")))?
        }
        "add" if args.len() > 1 => {
            let position = usize_arg(args, 0)?;
            if position > list.len() {
                return Err(RenderError::evaluation(format!("index {position} out of bounds")));
            }
            list.insert(position, arg(args, 1));
            TemplateValue::null()
        }
        "add" => {
            list.push(arg(args, 0));
            true.into()
        }
        "addAll" => {
            let items = list_arg(args, 0)?;
            let changed = !items.is_empty();
            for item in items {
                list.push(item);
            }
            changed.into()
        }
        "contains" => list.contains(&arg(args, 0)).into(),
        "containsAll" => list_arg(args, 0)?.iter().all(|item| list.contains(item)).into(),
        "indexOf" => list
            .borrow()
            .iter()
            .position(|item| *item == arg(args, 0))
            .map_or(TemplateValue::from(-1), TemplateValue::from),
        "remove" => list.remove_value(&arg(args, 0)).into(),
        "removeAll" => {
            let mut changed = false;
            for item in list_arg(args, 0)? {
                while list.remove_value(&item) {
                    changed = true;
                }
            }
            changed.into()
        }
        "retainAll" => return Err(RenderError::evaluation("retainAll is not supported on lists")),
        "clear" => {
            list.clear();
            TemplateValue::null()
        }
        "equals" => (arg(args, 0) == TemplateValue::List(list.clone())).into(),
        "toString" => TemplateValue::List(list.clone()).to_string().into(),
        "toJSON" => TemplateValue::List(list.clone()).deep_copy(),
        _ => return Err(RenderError::unsupported("list", method)),
    };

    Ok(value)
}

fn map_method(map: &MapValue, method: &str, args: &[TemplateValue]) -> Result<TemplateValue, RenderError> {
    let value: TemplateValue = match method {
        "get" => map.get(&arg(args, 0).to_string()),
        "put" => map
            .insert(arg(args, 0).to_string(), arg(args, 1))
            .unwrap_or_else(TemplateValue::null),
        "putAll" => {
            let source = arg(args, 0);
            let source = source
                .as_map()
                .ok_or_else(|| RenderError::evaluation("putAll expects a map"))?;
            // Entries are copied out first, `$m.putAll($m)` must not hold two borrows.
            for (key, value) in source.entries() {
                map.insert(key, value);
            }
            TemplateValue::null()
        }
        "remove" => map.remove(&arg(args, 0).to_string()).unwrap_or_else(TemplateValue::null),
        "containsKey" => map.contains_key(&arg(args, 0).to_string()).into(),
        "containsValue" => {
            let needle = arg(args, 0);
            map.borrow().values().any(|value| *value == needle).into()
        }
        "keySet" => map
            .keys()
            .into_iter()
            .map(TemplateValue::from)
            .collect::<Vec<_>>()
            .into(),
        "values" => map
            .entries()
            .into_iter()
            .map(|(_, value)| value)
            .collect::<Vec<_>>()
            .into(),
        "entrySet" => map
            .entries()
            .into_iter()
            .map(|(key, value)| {
                let entry = MapValue::default();
                entry.insert("key", key.into());
                entry.insert("value", value);
                TemplateValue::Map(entry)
            })
            .collect::<Vec<_>>()
            .into(),
        "isEmpty" => map.is_empty().into(),
        "size" => map.len().into(),
        "clear" => {
            map.clear();
            TemplateValue::null()
        }
        "equals" => (arg(args, 0) == TemplateValue::Map(map.clone())).into(),
        "toString" => TemplateValue::Map(map.clone()).to_string().into(),
        "toJSON" => TemplateValue::Map(map.clone()).deep_copy(),
        _ => return Err(RenderError::unsupported("map", method)),
    };

    Ok(value)
}

/// Compiles a Java pattern. The supported syntax is the common subset of both engines.
pub(crate) fn compile(pattern: &str) -> Result<Regex, RenderError> {
    Regex::new(pattern).map_err(|error| RenderError::evaluation(format!("invalid pattern `{pattern}`: {error}")))
}

/// `String.matches`: the pattern has to cover the whole input.
pub(crate) fn full_match(pattern: &str, text: &str) -> Result<bool, RenderError> {
    Ok(compile(&format!("^(?:{pattern})$"))?.is_match(text))
}

/// `String.split`: only the tokens between matches are returned, capture groups never are,
/// and trailing empty tokens are dropped.
pub(crate) fn split(text: &str, pattern: &str) -> Result<Vec<String>, RenderError> {
    let regex = compile(pattern)?;

    if !regex.is_match(text) {
        return Ok(vec![text.to_string()]);
    }

    let mut tokens = Vec::new();
    let mut last = 0;

    for found in regex.find_iter(text) {
        // A zero-width match at the very start never yields a leading empty token.
        if found.end() == 0 {
            continue;
        }
        tokens.push(text[last..found.start()].to_string());
        last = found.end();
    }
    tokens.push(text[last..].to_string());

    while tokens.last().is_some_and(String::is_empty) {
        tokens.pop();
    }

    Ok(tokens)
}

/// Translates `$1` style group references and `\` escapes of a Java replacement string.
fn java_replacement(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('$') => out.push_str("$$"),
                Some(other) => out.push(other),
                None => {}
            },
            '$' => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(*d);
                    chars.next();
                }
                if digits.is_empty() {
                    out.push_str("$$");
                } else {
                    out.push_str("${");
                    out.push_str(&digits);
                    out.push('}');
                }
            }
            other => out.push(other),
        }
    }

    out
}

fn char_position(text: &str, byte_offset: Option<usize>) -> TemplateValue {
    match byte_offset {
        Some(offset) => text[..offset].chars().count().into(),
        None => TemplateValue::from(-1),
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn list_index(index: &TemplateValue, len: usize) -> Result<usize, RenderError> {
    let position = index
        .as_i64()
        .ok_or_else(|| RenderError::evaluation(format!("list index must be an integer, got {}", index.type_name())))?;

    // Negative indexes count from the end.
    let resolved = if position < 0 {
        i64::try_from(len).unwrap_or(i64::MAX) + position
    } else {
        position
    };

    usize::try_from(resolved).map_err(|_| RenderError::evaluation(format!("index {position} out of bounds")))
}

pub(crate) fn arg(args: &[TemplateValue], position: usize) -> TemplateValue {
    args.get(position).cloned().unwrap_or_default()
}

pub(crate) fn string_arg(args: &[TemplateValue], position: usize) -> Result<String, RenderError> {
    match args.get(position) {
        Some(TemplateValue::String(s)) => Ok(s.as_str().to_string()),
        Some(value @ TemplateValue::Scalar(Scalar::Number(_) | Scalar::Bool(_))) => Ok(value.to_string()),
        Some(other) => Err(RenderError::evaluation(format!(
            "argument {position} must be a string, got {}",
            other.type_name()
        ))),
        None => Err(RenderError::evaluation(format!("missing argument {position}"))),
    }
}

pub(crate) fn usize_arg(args: &[TemplateValue], position: usize) -> Result<usize, RenderError> {
    args.get(position)
        .and_then(TemplateValue::as_i64)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| RenderError::evaluation(format!("argument {position} must be a non-negative integer")))
}

pub(crate) fn list_arg(args: &[TemplateValue], position: usize) -> Result<Vec<TemplateValue>, RenderError> {
    match args.get(position) {
        Some(TemplateValue::List(list)) => Ok(list.snapshot()),
        _ => Err(RenderError::evaluation(format!("argument {position} must be a list"))),
    }
}
