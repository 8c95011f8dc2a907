//! Recursive descent parser for the supported template language subset.
//!
//! Text is scanned character by character. Anything that does not form a valid reference
//! or directive is kept as literal text, the way the template engine treats stray `$` and
//! `#` characters.

use serde_json::Number;

use crate::{
    ast::{BinaryOp, Expr, Literal, Node, Reference, Segment, UnaryOp},
    ParseError,
};

pub(crate) fn parse(name: &str, source: &str) -> Result<Vec<Node>, ParseError> {
    let mut parser = Parser::new(name, source, false);
    let (nodes, end) = parser.block()?;

    match end {
        BlockEnd::Eof => Ok(nodes),
        BlockEnd::End(at) => Err(parser.error_at(at, "#end without a matching directive")),
        BlockEnd::Else(at) | BlockEnd::ElseIf(at, _) => Err(parser.error_at(at, "#else without a matching #if")),
    }
}

enum BlockEnd {
    Eof,
    End(usize),
    Else(usize),
    ElseIf(usize, Expr),
}

enum Directive {
    Node(Node),
    Text(String),
    Skip,
    Close(BlockEnd),
}

struct Parser<'a> {
    name: &'a str,
    source: &'a str,
    pos: usize,
    /// Inside a double quoted string only references are recognized.
    interpolating: bool,
}

impl<'a> Parser<'a> {
    fn new(name: &'a str, source: &'a str, interpolating: bool) -> Self {
        Parser {
            name,
            source,
            pos: 0,
            interpolating,
        }
    }

    fn block(&mut self) -> Result<(Vec<Node>, BlockEnd), ParseError> {
        let mut nodes = Vec::new();
        let mut text = String::new();

        loop {
            let Some(c) = self.peek() else {
                flush(&mut text, &mut nodes);
                return Ok((nodes, BlockEnd::Eof));
            };

            match c {
                '\\' if matches!(self.peek_nth(1), Some('$' | '#')) => {
                    self.bump();
                    if let Some(escaped) = self.bump() {
                        text.push(escaped);
                    }
                }
                '$' => match self.reference() {
                    Some(reference) => {
                        flush(&mut text, &mut nodes);
                        nodes.push(Node::Reference(reference));
                    }
                    None => {
                        self.bump();
                        text.push('$');
                    }
                },
                '#' if !self.interpolating => match self.directive()? {
                    Directive::Node(node) => {
                        flush(&mut text, &mut nodes);
                        nodes.push(node);
                    }
                    Directive::Text(literal) => text.push_str(&literal),
                    Directive::Skip => {}
                    Directive::Close(end) => {
                        flush(&mut text, &mut nodes);
                        return Ok((nodes, end));
                    }
                },
                c => {
                    self.bump();
                    text.push(c);
                }
            }
        }
    }

    fn directive(&mut self) -> Result<Directive, ParseError> {
        let start = self.pos;
        self.bump();

        if self.eat("#") {
            match self.rest().find('\n') {
                Some(offset) => self.pos += offset + 1,
                None => self.pos = self.source.len(),
            }
            return Ok(Directive::Skip);
        }

        if self.eat("*") {
            let offset = self
                .rest()
                .find("*#")
                .ok_or_else(|| self.error_at(start, "unterminated block comment"))?;
            self.pos += offset + 2;
            return Ok(Directive::Skip);
        }

        if self.eat("[[") {
            let offset = self
                .rest()
                .find("]]#")
                .ok_or_else(|| self.error_at(start, "unterminated unparsed block"))?;
            let content = self.rest()[..offset].to_string();
            self.pos += offset + 3;
            return Ok(Directive::Text(content));
        }

        let braced = self.eat("{");
        let Some(name) = self.ident() else {
            self.pos = start + 1;
            return Ok(Directive::Text("#".to_string()));
        };
        if braced && !self.eat("}") {
            self.pos = start + 1;
            return Ok(Directive::Text("#".to_string()));
        }

        let directive = match name.as_str() {
            "set" => {
                self.expect("(")?;
                self.skip_whitespace();
                let target = self.reference().ok_or_else(|| self.error("expected a reference in #set"))?;
                self.expect("=")?;
                let value = self.expression()?;
                self.expect(")")?;
                self.gobble();
                Directive::Node(Node::Set { target, value })
            }
            "if" => {
                let condition = self.condition()?;
                self.gobble();
                Directive::Node(self.if_chain(start, condition)?)
            }
            "elseif" => {
                let condition = self.condition()?;
                self.gobble();
                Directive::Close(BlockEnd::ElseIf(start, condition))
            }
            "else" => {
                self.gobble();
                Directive::Close(BlockEnd::Else(start))
            }
            "end" => {
                self.gobble();
                Directive::Close(BlockEnd::End(start))
            }
            "foreach" => {
                self.expect("(")?;
                self.skip_whitespace();
                if !self.eat("$") {
                    return Err(self.error("expected a loop variable"));
                }
                let variable = self.ident().ok_or_else(|| self.error("expected a loop variable"))?;
                self.skip_whitespace();
                if !self.keyword("in") {
                    return Err(self.error("expected `in`"));
                }
                let iterable = self.expression()?;
                self.expect(")")?;
                self.gobble();

                let (body, end) = self.block()?;
                if !matches!(end, BlockEnd::End(_)) {
                    return Err(self.error_at(start, "#foreach without a matching #end"));
                }

                Directive::Node(Node::Foreach {
                    variable,
                    iterable,
                    body,
                })
            }
            "break" => {
                self.gobble();
                Directive::Node(Node::Break)
            }
            "stop" => {
                self.gobble();
                Directive::Node(Node::Stop)
            }
            "return" => {
                let checkpoint = self.pos;
                self.skip_inline_whitespace();
                let value = if self.eat("(") {
                    self.skip_whitespace();
                    if self.eat(")") {
                        None
                    } else {
                        let value = self.expression()?;
                        self.expect(")")?;
                        Some(value)
                    }
                } else {
                    self.pos = checkpoint;
                    None
                };
                self.gobble();
                Directive::Node(Node::Return(value))
            }
            _ => {
                let after_name = self.pos;
                self.skip_inline_whitespace();

                let args = if self.peek() == Some('(') {
                    self.attempt(Self::macro_arguments)
                } else {
                    None
                };

                match args {
                    Some(args) => {
                        self.gobble();
                        Directive::Node(Node::Macro {
                            name,
                            args,
                            raw: self.source[start..self.pos].to_string(),
                        })
                    }
                    None => {
                        self.pos = after_name;
                        Directive::Text(self.source[start..after_name].to_string())
                    }
                }
            }
        };

        Ok(directive)
    }

    fn if_chain(&mut self, start: usize, first: Expr) -> Result<Node, ParseError> {
        let mut branches = Vec::new();
        let mut condition = first;

        loop {
            let (body, end) = self.block()?;

            match end {
                BlockEnd::ElseIf(_, next) => {
                    branches.push((condition, body));
                    condition = next;
                }
                BlockEnd::Else(_) => {
                    branches.push((condition, body));
                    let (otherwise, end) = self.block()?;
                    return match end {
                        BlockEnd::End(_) => Ok(Node::If {
                            branches,
                            otherwise: Some(otherwise),
                        }),
                        BlockEnd::Else(at) | BlockEnd::ElseIf(at, _) => {
                            Err(self.error_at(at, "#else must be the last branch of #if"))
                        }
                        BlockEnd::Eof => Err(self.error_at(start, "#if without a matching #end")),
                    };
                }
                BlockEnd::End(_) => {
                    branches.push((condition, body));
                    return Ok(Node::If {
                        branches,
                        otherwise: None,
                    });
                }
                BlockEnd::Eof => return Err(self.error_at(start, "#if without a matching #end")),
            }
        }
    }

    fn condition(&mut self) -> Result<Expr, ParseError> {
        self.expect("(")?;
        let condition = self.expression()?;
        self.expect(")")?;
        Ok(condition)
    }

    fn macro_arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect("(")?;
        let mut args = Vec::new();

        loop {
            self.skip_whitespace();
            if self.eat(")") {
                return Ok(args);
            }
            args.push(self.expression()?);
            self.skip_whitespace();
            self.eat(",");
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect("(")?;
        let mut args = Vec::new();

        self.skip_whitespace();
        if self.eat(")") {
            return Ok(args);
        }

        loop {
            args.push(self.expression()?);
            self.skip_whitespace();
            if !self.eat(",") {
                self.expect(")")?;
                return Ok(args);
            }
        }
    }

    /// Parses `$name`, `$!name`, `${name}` and `$!{name}` followed by any property, method
    /// and index segments. Restores the position and returns `None` when the text at the
    /// cursor is not a reference.
    fn reference(&mut self) -> Option<Reference> {
        self.attempt(Self::reference_inner)
    }

    fn reference_inner(&mut self) -> Result<Reference, ParseError> {
        let start = self.pos;
        if !self.eat("$") {
            return Err(self.error("expected `$`"));
        }
        let quiet = self.eat("!");
        let braced = self.eat("{");
        let root = self.ident().ok_or_else(|| self.error("expected an identifier"))?;

        let mut segments = Vec::new();
        loop {
            if self.peek() == Some('.') && self.peek_nth(1).is_some_and(is_ident_start) {
                let checkpoint = self.pos;
                self.bump();
                let Some(name) = self.ident() else {
                    self.pos = checkpoint;
                    break;
                };

                if self.peek() == Some('(') {
                    match self.attempt(Self::arguments) {
                        Some(args) => segments.push(Segment::Method(name, args)),
                        None => {
                            self.pos = checkpoint;
                            break;
                        }
                    }
                } else {
                    segments.push(Segment::Property(name));
                }
            } else if self.peek() == Some('[') {
                let index = self.attempt(|parser| {
                    parser.bump();
                    let index = parser.expression()?;
                    parser.expect("]")?;
                    Ok(index)
                });

                match index {
                    Some(index) => segments.push(Segment::Index(index)),
                    None => break,
                }
            } else {
                break;
            }
        }

        if braced && !self.eat("}") {
            return Err(self.error("expected `}`"));
        }

        Ok(Reference {
            root,
            segments,
            quiet,
            raw: self.source[start..self.pos].to_string(),
        })
    }

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.or()
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.and()?;
        loop {
            self.skip_whitespace();
            if self.eat("||") || self.keyword("or") {
                let right = self.and()?;
                left = binary(BinaryOp::Or, left, right);
            } else {
                return Ok(left);
            }
        }
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.equality()?;
        loop {
            self.skip_whitespace();
            if self.eat("&&") || self.keyword("and") {
                let right = self.equality()?;
                left = binary(BinaryOp::And, left, right);
            } else {
                return Ok(left);
            }
        }
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.relational()?;
        loop {
            self.skip_whitespace();
            let op = if self.eat("==") || self.keyword("eq") {
                BinaryOp::Eq
            } else if self.eat("!=") || self.keyword("ne") {
                BinaryOp::Ne
            } else {
                return Ok(left);
            };
            let right = self.relational()?;
            left = binary(op, left, right);
        }
    }

    fn relational(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.additive()?;
        loop {
            self.skip_whitespace();
            let op = if self.eat("<=") || self.keyword("le") {
                BinaryOp::Le
            } else if self.eat(">=") || self.keyword("ge") {
                BinaryOp::Ge
            } else if self.eat("<") || self.keyword("lt") {
                BinaryOp::Lt
            } else if self.eat(">") || self.keyword("gt") {
                BinaryOp::Gt
            } else {
                return Ok(left);
            };
            let right = self.additive()?;
            left = binary(op, left, right);
        }
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.multiplicative()?;
        loop {
            self.skip_whitespace();
            let op = if self.eat("+") {
                BinaryOp::Add
            } else if self.eat("-") {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            self.skip_whitespace();
            let op = if self.eat("*") {
                BinaryOp::Mul
            } else if self.eat("/") {
                BinaryOp::Div
            } else if self.eat("%") {
                BinaryOp::Rem
            } else {
                return Ok(left);
            };
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        self.skip_whitespace();
        if self.keyword("not") || (self.peek() == Some('!') && self.peek_nth(1) != Some('=') && self.eat("!")) {
            let operand = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        if self.eat("-") {
            let operand = self.unary()?;
            return Ok(Expr::Unary(UnaryOp::Negate, Box::new(operand)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        self.skip_whitespace();

        match self.peek() {
            Some('$') => self
                .reference()
                .map(Expr::Reference)
                .ok_or_else(|| self.error("invalid reference")),
            Some('\'') => self.single_quoted(),
            Some('"') => self.double_quoted(),
            Some('[') => self.list(),
            Some('{') => self.map(),
            Some('(') => {
                self.bump();
                let inner = self.expression()?;
                self.expect(")")?;
                Ok(inner)
            }
            Some(c) if c.is_ascii_digit() => self.number(),
            _ if self.keyword("true") => Ok(Expr::Literal(Literal::Bool(true))),
            _ if self.keyword("false") => Ok(Expr::Literal(Literal::Bool(false))),
            _ if self.keyword("null") => Ok(Expr::Literal(Literal::Null)),
            _ => Err(self.error("expected an expression")),
        }
    }

    fn single_quoted(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        self.bump();
        let mut content = String::new();

        loop {
            match self.bump() {
                None => return Err(self.error_at(start, "unterminated string")),
                Some('\'') if self.peek() == Some('\'') => {
                    self.bump();
                    content.push('\'');
                }
                Some('\'') => return Ok(Expr::Literal(Literal::String(content))),
                Some(c) => content.push(c),
            }
        }
    }

    fn double_quoted(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        self.bump();
        let mut content = String::new();

        loop {
            match self.bump() {
                None => return Err(self.error_at(start, "unterminated string")),
                Some('\\') if self.peek() == Some('"') => {
                    self.bump();
                    content.push('"');
                }
                Some('"') if self.peek() == Some('"') => {
                    self.bump();
                    content.push('"');
                }
                Some('"') => break,
                Some(c) => content.push(c),
            }
        }

        if !content.contains('$') {
            return Ok(Expr::Literal(Literal::String(content)));
        }

        let mut inner = Parser::new(self.name, &content, true);
        let (mut nodes, _) = inner.block()?;

        match nodes.as_mut_slice() {
            [Node::Text(text)] => Ok(Expr::Literal(Literal::String(std::mem::take(text)))),
            _ => Ok(Expr::Interpolated(nodes)),
        }
    }

    fn list(&mut self) -> Result<Expr, ParseError> {
        self.bump();
        self.skip_whitespace();
        if self.eat("]") {
            return Ok(Expr::List(Vec::new()));
        }

        let first = self.expression()?;
        self.skip_whitespace();
        if self.eat("..") {
            let last = self.expression()?;
            self.expect("]")?;
            return Ok(Expr::Range(Box::new(first), Box::new(last)));
        }

        let mut items = vec![first];
        loop {
            self.skip_whitespace();
            if self.eat(",") {
                items.push(self.expression()?);
            } else {
                self.expect("]")?;
                return Ok(Expr::List(items));
            }
        }
    }

    fn map(&mut self) -> Result<Expr, ParseError> {
        self.bump();
        self.skip_whitespace();
        let mut entries = Vec::new();
        if self.eat("}") {
            return Ok(Expr::Map(entries));
        }

        loop {
            let key = self.expression()?;
            self.expect(":")?;
            let value = self.expression()?;
            entries.push((key, value));
            self.skip_whitespace();
            if !self.eat(",") {
                self.expect("}")?;
                return Ok(Expr::Map(entries));
            }
        }
    }

    fn number(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }

        let decimal = self.peek() == Some('.') && self.peek_nth(1).is_some_and(|c| c.is_ascii_digit());
        if decimal {
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }

        let text = &self.source[start..self.pos];
        let number = if decimal {
            text.parse::<f64>().ok().and_then(Number::from_f64)
        } else {
            text.parse::<i64>().ok().map(Number::from)
        };

        number
            .map(|n| Expr::Literal(Literal::Number(n)))
            .ok_or_else(|| self.error_at(start, format!("invalid number `{text}`")))
    }

    /// Consumes trailing spaces and the line break that follow a directive.
    fn gobble(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start_matches([' ', '\t']);

        if let Some(after) = trimmed.strip_prefix("\r\n").or_else(|| trimmed.strip_prefix('\n')) {
            self.pos += rest.len() - after.len();
        }
    }

    fn attempt<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, ParseError>) -> Option<T> {
        let checkpoint = self.pos;
        match f(self) {
            Ok(value) => Some(value),
            Err(_) => {
                self.pos = checkpoint;
                None
            }
        }
    }

    fn keyword(&mut self, word: &str) -> bool {
        let rest = self.rest();
        let matches = rest.starts_with(word) && !rest[word.len()..].chars().next().is_some_and(is_ident_char);
        if matches {
            self.pos += word.len();
        }
        matches
    }

    fn ident(&mut self) -> Option<String> {
        let rest = self.rest();
        if !rest.chars().next().is_some_and(is_ident_start) {
            return None;
        }

        let end = rest.find(|c: char| !is_ident_char(c)).unwrap_or(rest.len());
        self.pos += end;
        Some(rest[..end].to_string())
    }

    fn expect(&mut self, token: &str) -> Result<(), ParseError> {
        self.skip_whitespace();
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{token}`")))
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn skip_inline_whitespace(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.bump();
        }
    }

    fn rest(&self) -> &'a str {
        &self.source[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        self.error_at(self.pos, message)
    }

    fn error_at(&self, at: usize, message: impl Into<String>) -> ParseError {
        let before = &self.source[..at];
        let line = before.matches('\n').count() + 1;
        let column = before.rsplit('\n').next().map_or(0, |line| line.chars().count()) + 1;

        ParseError {
            name: self.name.to_string(),
            line,
            column,
            message: message.into(),
        }
    }
}

fn flush(text: &mut String, nodes: &mut Vec<Node>) {
    if !text.is_empty() {
        nodes.push(Node::Text(std::mem::take(text)));
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary(op, Box::new(left), Box::new(right))
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
