//! Mapping templates: a Velocity flavoured template language evaluated over JSON values
//! that behave like Java collections.
//!
//! ```text
//! #set($id = $util.autoId())
//! {
//!   "operation": "PutItem",
//!   "key": { "id": $util.dynamodb.toDynamoDBJson($id) },
//!   "attributeValues": $util.dynamodb.toMapValuesJson($ctx.args.input)
//! }
//! ```

mod ast;
mod error;
mod methods;
mod parser;
mod render;
pub mod util;
mod value;

pub use error::{ErrorKind, ParseError, RenderError, ResolverError};
pub use render::{Context, MacroFn, Macros, Template};
pub use util::Util;
pub use value::{adapt, unadapt, Adapt, ListValue, MapValue, NativeObject, Scalar, StringValue, TemplateValue};

/// Parses and renders `source` in one go.
pub fn render(source: &str, context: &Context, macros: &Macros) -> Result<String, RenderError> {
    Template::parse("inline", source)?.render(context, macros)
}

/// Renders a template whose context has `util` installed.
///
/// A failure raised after the template already reported errors through `$util` is dropped
/// and `Ok(None)` returned, so the caller surfaces the reported errors instead of whatever
/// failure they led to.
pub fn render_reporting(
    template: &Template,
    context: &Context,
    macros: &Macros,
    util: &Util,
) -> Result<Option<String>, RenderError> {
    match template.render(context, macros) {
        Ok(output) => Ok(Some(output)),
        Err(error) if util.has_errors() => {
            tracing::debug!(template = template.name(), %error, "render failure superseded by reported errors");
            Ok(None)
        }
        Err(error) => Err(error),
    }
}
