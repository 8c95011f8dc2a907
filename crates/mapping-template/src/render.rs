use std::{collections::HashMap, fmt::Write, sync::Arc};

use serde_json::Number;

use crate::{
    ast::{BinaryOp, Expr, Literal, Node, Reference, Segment, UnaryOp},
    methods,
    value::{MapValue, Scalar},
    Adapt, ParseError, RenderError, TemplateValue,
};

/// A parsed template. Immutable and shareable across threads, rendering builds its own
/// scope every time.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(name: impl Into<String>, source: &str) -> Result<Self, ParseError> {
        let name = name.into();
        let nodes = crate::parser::parse(&name, source)?;
        Ok(Template { name, nodes })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render(&self, context: &Context, macros: &Macros) -> Result<String, RenderError> {
        tracing::debug!(template = %self.name, "rendering template");

        let mut renderer = Renderer {
            variables: context.variables.clone(),
            macros,
            output: String::new(),
        };

        let output = match renderer.nodes(&self.nodes)? {
            Flow::Return(Some(value)) => value.to_json().to_string(),
            _ => renderer.output,
        };

        tracing::debug!(template = %self.name, %output, "rendered template");

        Ok(output)
    }
}

/// Top level variables visible to a template.
#[derive(Clone, Default)]
pub struct Context {
    variables: HashMap<String, TemplateValue>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Adapt) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Adapt) {
        self.variables.insert(name.into(), value.adapt());
    }

    pub fn get(&self, name: &str) -> Option<&TemplateValue> {
        self.variables.get(name)
    }
}

pub type MacroFn = dyn Fn(&[TemplateValue]) -> Result<String, RenderError> + Send + Sync;

/// Named functions callable as `#name(args)`.
#[derive(Clone, Default)]
pub struct Macros {
    macros: HashMap<String, Arc<MacroFn>>,
}

impl Macros {
    /// No macros at all.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&[TemplateValue]) -> Result<String, RenderError> + Send + Sync + 'static,
    ) {
        self.macros.insert(name.into(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&MacroFn> {
        self.macros.get(name).map(AsRef::as_ref)
    }

    /// The default set: `#console(..)` logs its arguments and renders nothing.
    pub fn with_defaults() -> Self {
        let mut macros = Self::empty();
        macros.register("console", |args| {
            let line = args.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
            tracing::info!(target: "mapping_template::console", "{line}");
            Ok(String::new())
        });
        macros
    }
}

impl std::fmt::Debug for Macros {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.macros.keys()).finish()
    }
}

enum Flow {
    Normal,
    Break,
    Stop,
    Return(Option<TemplateValue>),
}

struct Renderer<'m> {
    variables: HashMap<String, TemplateValue>,
    macros: &'m Macros,
    output: String,
}

impl Renderer<'_> {
    fn nodes(&mut self, nodes: &[Node]) -> Result<Flow, RenderError> {
        for node in nodes {
            match self.node(node)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn node(&mut self, node: &Node) -> Result<Flow, RenderError> {
        match node {
            Node::Text(text) => self.output.push_str(text),
            Node::Reference(reference) => {
                let value = self.resolve(reference)?;
                if !value.is_null_or_undefined() {
                    write!(self.output, "{value}").map_err(|e| RenderError::evaluation(e.to_string()))?;
                } else if !reference.quiet {
                    self.output.push_str(&reference.raw);
                }
            }
            Node::Set { target, value } => {
                let value = self.evaluate(value)?;
                self.assign(target, value)?;
            }
            Node::If { branches, otherwise } => {
                for (condition, body) in branches {
                    if self.evaluate(condition)?.is_truthy() {
                        return self.nodes(body);
                    }
                }
                if let Some(body) = otherwise {
                    return self.nodes(body);
                }
            }
            Node::Foreach {
                variable,
                iterable,
                body,
            } => return self.foreach(variable, iterable, body),
            Node::Break => return Ok(Flow::Break),
            Node::Stop => return Ok(Flow::Stop),
            Node::Return(value) => {
                let value = value.as_ref().map(|value| self.evaluate(value)).transpose()?;
                return Ok(Flow::Return(value));
            }
            Node::Macro { name, args, raw } => match self.macros.get(name) {
                Some(f) => {
                    let args = self.arguments(args)?;
                    let rendered = f(&args)?;
                    self.output.push_str(&rendered);
                }
                None => self.output.push_str(raw),
            },
        }

        Ok(Flow::Normal)
    }

    fn foreach(&mut self, variable: &str, iterable: &Expr, body: &[Node]) -> Result<Flow, RenderError> {
        let items = match self.evaluate(iterable)? {
            TemplateValue::List(list) => list.snapshot(),
            TemplateValue::Map(map) => map.entries().into_iter().map(|(_, value)| value).collect(),
            other => {
                tracing::debug!(type_name = other.type_name(), "#foreach over a value that is not iterable");
                Vec::new()
            }
        };

        let previous_item = self.variables.get(variable).cloned();
        let previous_foreach = self.variables.get("foreach").cloned();
        let count = items.len();
        let mut flow = Flow::Normal;

        for (index, item) in items.into_iter().enumerate() {
            let foreach = MapValue::default();
            foreach.insert("index", index.into());
            foreach.insert("count", (index + 1).into());
            foreach.insert("hasNext", (index + 1 < count).into());
            foreach.insert("first", (index == 0).into());
            foreach.insert("last", (index + 1 == count).into());

            self.variables.insert(variable.to_string(), item);
            self.variables.insert("foreach".to_string(), foreach.into());

            match self.nodes(body)? {
                Flow::Normal => {}
                Flow::Break => break,
                other => {
                    flow = other;
                    break;
                }
            }
        }

        restore(&mut self.variables, variable, previous_item);
        restore(&mut self.variables, "foreach", previous_foreach);

        Ok(flow)
    }

    fn resolve(&mut self, reference: &Reference) -> Result<TemplateValue, RenderError> {
        let root = self.variables.get(&reference.root).cloned().unwrap_or_default();
        self.walk(root, &reference.segments)
    }

    fn walk(&mut self, mut value: TemplateValue, segments: &[Segment]) -> Result<TemplateValue, RenderError> {
        for segment in segments {
            if value.is_null_or_undefined() {
                return Ok(TemplateValue::Undefined);
            }

            value = match segment {
                Segment::Property(name) => methods::property(&value, name)?,
                Segment::Method(name, args) => {
                    let args = self.arguments(args)?;
                    methods::call(&value, name, &args)?
                }
                Segment::Index(index) => {
                    let index = self.evaluate(index)?;
                    methods::index(&value, &index)?
                }
            };
        }

        Ok(value)
    }

    fn assign(&mut self, target: &Reference, value: TemplateValue) -> Result<(), RenderError> {
        let Some((last, parents)) = target.segments.split_last() else {
            self.variables.insert(target.root.clone(), value);
            return Ok(());
        };

        let root = self.variables.get(&target.root).cloned().unwrap_or_default();
        let parent = self.walk(root, parents)?;

        if parent.is_null_or_undefined() {
            tracing::debug!(target = %target.raw, "#set on a null reference ignored");
            return Ok(());
        }

        match (last, &parent) {
            (Segment::Property(name), TemplateValue::Map(map)) => {
                map.insert(name.clone(), value);
            }
            (Segment::Index(index), TemplateValue::Map(map)) => {
                let key = self.evaluate(index)?.to_string();
                map.insert(key, value);
            }
            (Segment::Index(index), TemplateValue::List(_)) => {
                let index = self.evaluate(index)?;
                methods::call(&parent, "set", &[index, value])?;
            }
            _ => {
                return Err(RenderError::evaluation(format!(
                    "cannot assign to `{}` on a {}",
                    target.raw,
                    parent.type_name()
                )))
            }
        }

        Ok(())
    }

    fn arguments(&mut self, args: &[Expr]) -> Result<Vec<TemplateValue>, RenderError> {
        args.iter().map(|arg| self.evaluate(arg)).collect()
    }

    fn evaluate(&mut self, expr: &Expr) -> Result<TemplateValue, RenderError> {
        let value = match expr {
            Expr::Literal(Literal::Null) => TemplateValue::null(),
            Expr::Literal(Literal::Bool(b)) => (*b).into(),
            Expr::Literal(Literal::Number(n)) => n.clone().into(),
            Expr::Literal(Literal::String(s)) => s.as_str().into(),
            Expr::Interpolated(nodes) => {
                let outer = std::mem::take(&mut self.output);
                let flow = self.nodes(nodes);
                let inner = std::mem::replace(&mut self.output, outer);
                flow?;
                inner.into()
            }
            Expr::Reference(reference) => self.resolve(reference)?,
            Expr::List(items) => self.arguments(items)?.into(),
            Expr::Range(start, end) => {
                let start = integer(&self.evaluate(start)?)?;
                let end = integer(&self.evaluate(end)?)?;
                let items: Vec<TemplateValue> = if start <= end {
                    (start..=end).map(TemplateValue::from).collect()
                } else {
                    (end..=start).rev().map(TemplateValue::from).collect()
                };
                items.into()
            }
            Expr::Map(entries) => {
                let map = MapValue::default();
                for (key, value) in entries {
                    let key = self.evaluate(key)?.to_string();
                    let value = self.evaluate(value)?;
                    map.insert(key, value);
                }
                map.into()
            }
            Expr::Unary(UnaryOp::Not, operand) => (!self.evaluate(operand)?.is_truthy()).into(),
            Expr::Unary(UnaryOp::Negate, operand) => {
                let operand = self.evaluate(operand)?;
                arithmetic(BinaryOp::Sub, &TemplateValue::from(0), &operand)?
            }
            Expr::Binary(BinaryOp::And, left, right) => {
                (self.evaluate(left)?.is_truthy() && self.evaluate(right)?.is_truthy()).into()
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                (self.evaluate(left)?.is_truthy() || self.evaluate(right)?.is_truthy()).into()
            }
            Expr::Binary(op, left, right) => {
                let left = self.evaluate(left)?;
                let right = self.evaluate(right)?;
                binary(*op, &left, &right)?
            }
        };

        Ok(value)
    }
}

fn restore(variables: &mut HashMap<String, TemplateValue>, name: &str, previous: Option<TemplateValue>) {
    match previous {
        Some(value) => variables.insert(name.to_string(), value),
        None => variables.remove(name),
    };
}

fn binary(op: BinaryOp, left: &TemplateValue, right: &TemplateValue) -> Result<TemplateValue, RenderError> {
    let value = match op {
        BinaryOp::Eq => loose_eq(left, right).into(),
        BinaryOp::Ne => (!loose_eq(left, right)).into(),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
            let ordering = compare(left, right).ok_or_else(|| {
                RenderError::evaluation(format!("cannot compare {} with {}", left.type_name(), right.type_name()))
            })?;
            match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Le => ordering.is_le(),
                _ => ordering.is_ge(),
            }
            .into()
        }
        BinaryOp::Add if left.as_str().is_some() || right.as_str().is_some() => format!("{left}{right}").into(),
        _ => arithmetic(op, left, right)?,
    };

    Ok(value)
}

/// Numbers compare by value, a string compares with the text of anything else.
fn loose_eq(left: &TemplateValue, right: &TemplateValue) -> bool {
    match (left, right) {
        (TemplateValue::Scalar(Scalar::Number(a)), TemplateValue::Scalar(Scalar::Number(b))) => {
            match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a == b,
                _ => a.as_f64() == b.as_f64(),
            }
        }
        (a, b) if a.is_null_or_undefined() && b.is_null_or_undefined() => true,
        (TemplateValue::String(_), other) | (other, TemplateValue::String(_)) if !other.is_null_or_undefined() => {
            left.to_string() == right.to_string()
        }
        _ => left == right,
    }
}

fn compare(left: &TemplateValue, right: &TemplateValue) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (TemplateValue::String(a), TemplateValue::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => {
            let (a, b) = (left.as_number()?, right.as_number()?);
            match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
            }
        }
    }
}

fn arithmetic(op: BinaryOp, left: &TemplateValue, right: &TemplateValue) -> Result<TemplateValue, RenderError> {
    let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
        return Err(RenderError::evaluation(format!(
            "arithmetic on {} and {}",
            left.type_name(),
            right.type_name()
        )));
    };

    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => a.checked_div(b),
            BinaryOp::Rem => a.checked_rem(b),
            _ => None,
        };
        return result
            .map(TemplateValue::from)
            .ok_or_else(|| RenderError::evaluation(format!("integer overflow or division by zero: {a} {op:?} {b}")));
    }

    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        _ => a % b,
    };

    Number::from_f64(result)
        .map(TemplateValue::from)
        .ok_or_else(|| RenderError::evaluation(format!("{a} {op:?} {b} is not a number")))
}

fn integer(value: &TemplateValue) -> Result<i64, RenderError> {
    value
        .as_i64()
        .ok_or_else(|| RenderError::evaluation(format!("range bounds must be integers, got {}", value.type_name())))
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_snapshot;
    use serde_json::json;

    use super::*;

    fn render(source: &str, context: serde_json::Value) -> String {
        let mut ctx = Context::new();
        if let serde_json::Value::Object(variables) = context {
            for (name, value) in variables {
                ctx.insert(name, value);
            }
        }
        Template::parse("test", source)
            .unwrap()
            .render(&ctx, &Macros::with_defaults())
            .unwrap()
    }

    #[test]
    fn list_add_and_index() {
        let out = render(
            indoc! {"
                #set($foo = [])
                #set($x = $foo.add(0))
                #set($x = $foo.add(1))
                $foo[0] - $foo[1]
            "},
            json!({}),
        );
        assert_eq!(out.trim(), "0 - 1");
    }

    #[test]
    fn foreach_keeps_indentation() {
        let source = "\n        #foreach ( $value in $ctx.values )\n        $value\n        #end\n        ";
        let out = render(source, json!({ "ctx": { "values": [1, 2, 3] } }));
        assert_eq!(out.trim(), "1\n                2\n                3");
    }

    #[test]
    fn foreach_loop_variables() {
        let out = render(
            "#foreach($v in ['a', 'b', 'c'])$foreach.index:$v#if($foreach.hasNext),#end#end",
            json!({}),
        );
        assert_eq!(out, "0:a,1:b,2:c");
    }

    #[test]
    fn foreach_break() {
        let out = render("#foreach($i in [1..5])#if($i > 2)#break#end$i#end", json!({}));
        assert_eq!(out, "12");
    }

    #[test]
    fn nested_map_mutation_is_shared() {
        let out = render(
            indoc! {r#"
                #set($foo = { "bar": { "baz": {} } })
                #set($value = $foo.bar.baz.put('hello', 'worked'))
                #console($foo)
                $foo.bar.baz.hello
            "#},
            json!({}),
        );
        assert_eq!(out.trim(), "worked");
    }

    #[test]
    fn put_all_renders_java_map() {
        let out = render(
            indoc! {"
                #set($item = {})
                #set($ignore = $item.putAll($ctx.result))
                $item.toJSON()
            "},
            json!({ "ctx": { "result": { "pk": "pk-123", "sk": "sk" } } }),
        );
        assert_eq!(out.trim(), "{pk=pk-123, sk=sk}");
    }

    #[test]
    fn replace_all_in_put() {
        let out = render(
            indoc! {"
                #set($item = {})
                #set($ignore = $item.put('id', $ctx.result.pk.replaceAll('pk-', '')))
                $item.toJSON()
            "},
            json!({ "ctx": { "result": { "pk": "pk-123" } } }),
        );
        assert_eq!(out.trim(), "{id=123}");
    }

    #[test]
    fn split_variants() {
        let cases = [
            (r#""\|""#, "a|b|c", "[a, b, c]"),
            (r#""(\|)""#, "a|b|c", "[a, b, c]"),
            (r#""(\|)(x)""#, "a|xb|xc", "[a, b, c]"),
        ];

        for (pattern, input, expected) in cases {
            let source = format!("#set($parts = $ctx.args.str.split({pattern}))\n$parts.toJSON()");
            let out = render(&source, json!({ "ctx": { "args": { "str": input } } }));
            assert_eq!(out.trim(), expected, "pattern {pattern}");
        }
    }

    #[test]
    fn null_references_render_their_source() {
        let out = render("$missing|$!missing|${missing.a}|$!{missing}", json!({}));
        assert_eq!(out, "$missing||${missing.a}|");
    }

    #[test]
    fn double_quoted_strings_interpolate() {
        let out = render(
            r#"#set($greeting = "Hello ${name}!")$greeting 'single $name'"#,
            json!({ "name": "world" }),
        );
        assert_eq!(out, "Hello world! 'single world'");

        let out = render(r#"#set($s = 'raw $name')$s"#, json!({ "name": "world" }));
        assert_eq!(out, "raw $name");
    }

    #[test]
    fn if_elseif_else() {
        let source = "#if($n == 1)one#elseif($n eq 2)two#{else}many#end";
        assert_eq!(render(source, json!({ "n": 1 })), "one");
        assert_eq!(render(source, json!({ "n": 2 })), "two");
        assert_eq!(render(source, json!({ "n": 3 })), "many");
    }

    #[test]
    fn only_null_and_false_are_falsy() {
        let source = "#if($v)yes#{else}no#end";
        assert_eq!(render(source, json!({ "v": "" })), "yes");
        assert_eq!(render(source, json!({ "v": 0 })), "yes");
        assert_eq!(render(source, json!({ "v": [] })), "yes");
        assert_eq!(render(source, json!({ "v": false })), "no");
        assert_eq!(render(source, json!({ "v": null })), "no");
        assert_eq!(render(source, json!({})), "no");
    }

    #[test]
    fn arithmetic_and_concatenation() {
        assert_eq!(render("#set($a = 7 / 2)$a", json!({})), "3");
        assert_eq!(render("#set($a = 7.0 / 2)$a", json!({})), "3.5");
        assert_eq!(render("#set($a = 'n' + 1)$a", json!({})), "n1");
        assert_eq!(render("#set($a = -$b % 3)$a", json!({ "b": 7 })), "-1");
    }

    #[test]
    fn logical_operators() {
        let out = render(
            "#if($a && !$b)1#end#if($a and not $b)2#end#if($b || $a)3#end#if($b or $c)4#end",
            json!({ "a": true, "b": false, "c": null }),
        );
        assert_eq!(out, "123");
    }

    #[test]
    fn set_through_properties_and_indexes() {
        let out = render(
            indoc! {r#"
                #set($ctx.stash.a = 1)
                #set($ctx.stash["b"] = 2)
                #set($list = [0, 0])
                #set($list[1] = 5)
                $ctx.stash $list
            "#},
            json!({ "ctx": { "stash": {} } }),
        );
        assert_eq!(out.trim(), "{a=1, b=2} [0, 5]");
    }

    #[test]
    fn stop_ends_rendering() {
        assert_eq!(render("before#stop after", json!({})), "before");
    }

    #[test]
    fn return_replaces_output_with_json() {
        let out = render("ignored#return($ctx.result)", json!({ "ctx": { "result": { "a": [1] } } }));
        assert_eq!(out, r#"{"a":[1]}"#);
    }

    #[test]
    fn unknown_macros_render_literally() {
        assert_eq!(render("#nope($a)", json!({})), "#nope($a)");
    }

    #[test]
    fn foreach_restores_outer_variable() {
        let out = render("#set($v = 'outer')#foreach($v in [1, 2])$v#end$v", json!({}));
        assert_eq!(out, "12outer");
    }

    #[test]
    fn method_errors_surface() {
        let template = Template::parse("t", "$list.retainAll([])").unwrap();
        let context = Context::new().with("list", json!([1]));
        let error = template.render(&context, &Macros::empty()).unwrap_err();

        assert_snapshot!(error, @"retainAll is not supported on lists");
    }
}
