//! User formulas that re-derive the four hourly values.
//!
//! The language is deliberately closed: number literals, the four fixing
//! values of the record, a few timestamp accessors, arithmetic, comparisons
//! and a fixed set of functions. Nothing outside the record is reachable.

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use thiserror::Error;

use crate::prices::types::{Field, HourRecord};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{name}' does not accept {given} argument(s)")]
    Arity { name: String, given: usize },
    #[error("result is not a finite number")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Variable {
    Field(Field),
    Hour,
    Day,
    Month,
    Year,
    Weekday,
}

impl Variable {
    fn lookup(name: &str) -> Option<Self> {
        if let Some(field) = Field::from_key(name) {
            return Some(Variable::Field(field));
        }
        match name {
            "hour" => Some(Variable::Hour),
            "day" => Some(Variable::Day),
            "month" => Some(Variable::Month),
            "year" => Some(Variable::Year),
            "weekday" => Some(Variable::Weekday),
            _ => None,
        }
    }

    fn value(&self, record: &HourRecord) -> f64 {
        let time = &record.time;
        match self {
            Variable::Field(field) => field.get(record),
            Variable::Hour => time.hour() as f64,
            Variable::Day => time.day() as f64,
            Variable::Month => time.month() as f64,
            Variable::Year => time.year() as f64,
            Variable::Weekday => time.weekday().number_from_monday() as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    Abs,
    Floor,
    Ceil,
    Round,
    Min,
    Max,
    If,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(Function::Abs),
            "floor" => Some(Function::Floor),
            "ceil" => Some(Function::Ceil),
            "round" => Some(Function::Round),
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "if" => Some(Function::If),
            _ => None,
        }
    }

    fn accepts(&self, count: usize) -> bool {
        match self {
            Function::Abs | Function::Floor | Function::Ceil => count == 1,
            Function::Round => count == 1 || count == 2,
            Function::Min | Function::Max => count >= 1,
            Function::If => count == 3,
        }
    }

    fn apply(&self, args: &[f64]) -> f64 {
        match self {
            Function::Abs => args[0].abs(),
            Function::Floor => args[0].floor(),
            Function::Ceil => args[0].ceil(),
            Function::Round => match args.get(1) {
                Some(digits) => {
                    let factor = 10_f64.powi(*digits as i32);
                    (args[0] * factor).round() / factor
                }
                None => args[0].round(),
            },
            Function::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            Function::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Function::If => {
                if args[0] != 0.0 {
                    args[1]
                } else {
                    args[2]
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinaryOp {
    fn apply(&self, lhs: f64, rhs: f64) -> f64 {
        let truth = |b: bool| if b { 1.0 } else { 0.0 };
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Rem => lhs % rhs,
            BinaryOp::Pow => lhs.powf(rhs),
            BinaryOp::Lt => truth(lhs < rhs),
            BinaryOp::Le => truth(lhs <= rhs),
            BinaryOp::Gt => truth(lhs > rhs),
            BinaryOp::Ge => truth(lhs >= rhs),
            BinaryOp::Eq => truth(lhs == rhs),
            BinaryOp::Ne => truth(lhs != rhs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Var(Variable),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    fn eval(&self, record: &HourRecord) -> f64 {
        match self {
            Expr::Number(n) => *n,
            Expr::Var(var) => var.value(record),
            Expr::Neg(inner) => -inner.eval(record),
            Expr::Binary(op, lhs, rhs) => op.apply(lhs.eval(record), rhs.eval(record)),
            Expr::Call(function, args) => {
                let values: Vec<f64> = args.iter().map(|a| a.eval(record)).collect();
                function.apply(&values)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(BinaryOp),
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, TemplateError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while let Some(&(pos, c)) = chars.get(i) {
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let (token, width) = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '0'..='9' | '.' => {
                let mut end = chars[i..]
                    .iter()
                    .position(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
                    .map_or(chars.len(), |offset| i + offset);
                end = exponent_end(&chars, end).unwrap_or(end);
                let text: String = chars[i..end].iter().map(|(_, c)| c).collect();
                let value = text.parse::<f64>().map_err(|_| TemplateError::Syntax {
                    position: pos,
                    message: format!("invalid number '{}'", text),
                })?;
                (Token::Number(value), end - i)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let end = chars[i..]
                    .iter()
                    .position(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
                    .map_or(chars.len(), |offset| i + offset);
                let name: String = chars[i..end].iter().map(|(_, c)| c).collect();
                (Token::Ident(name), end - i)
            }
            '+' => (Token::Op(BinaryOp::Add), 1),
            '-' => (Token::Op(BinaryOp::Sub), 1),
            '*' if next == Some('*') => (Token::Op(BinaryOp::Pow), 2),
            '*' => (Token::Op(BinaryOp::Mul), 1),
            '/' => (Token::Op(BinaryOp::Div), 1),
            '%' => (Token::Op(BinaryOp::Rem), 1),
            '^' => (Token::Op(BinaryOp::Pow), 1),
            '<' if next == Some('=') => (Token::Op(BinaryOp::Le), 2),
            '<' => (Token::Op(BinaryOp::Lt), 1),
            '>' if next == Some('=') => (Token::Op(BinaryOp::Ge), 2),
            '>' => (Token::Op(BinaryOp::Gt), 1),
            '=' if next == Some('=') => (Token::Op(BinaryOp::Eq), 2),
            '!' if next == Some('=') => (Token::Op(BinaryOp::Ne), 2),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            ',' => (Token::Comma, 1),
            other => {
                return Err(TemplateError::Syntax {
                    position: pos,
                    message: format!("unexpected character '{}'", other),
                })
            }
        };
        tokens.push((pos, token));
        i += width;
    }

    Ok(tokens)
}

/// End of an `e`/`E` exponent starting at `start`, if one is there.
fn exponent_end(chars: &[(usize, char)], start: usize) -> Option<usize> {
    let (_, marker) = chars.get(start)?;
    if !matches!(marker, 'e' | 'E') {
        return None;
    }
    let mut digits = start + 1;
    if matches!(chars.get(digits), Some((_, '+' | '-'))) {
        digits += 1;
    }
    let count = chars[digits.min(chars.len())..]
        .iter()
        .take_while(|(_, c)| c.is_ascii_digit())
        .count();
    (count > 0).then_some(digits + count)
}

/// Maximum nesting of parentheses, unary signs and function calls.
const MAX_DEPTH: usize = 64;
/// Longest formula accepted, in tokens.
const MAX_TOKENS: usize = 512;

/// Recursive descent over the token list.
///
/// comparison := sum (cmp sum)?
/// sum        := product (("+" | "-") product)*
/// product    := unary (("*" | "/" | "%") unary)*
/// unary      := ("-" | "+") unary | power
/// power      := primary ("^" unary)?
/// primary    := number | ident | ident "(" args ")" | "(" comparison ")"
struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(p, _)| *p)
    }

    fn error(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::Syntax {
            position: self.position(),
            message: message.into(),
        }
    }

    fn next_op(&mut self, allowed: &[BinaryOp]) -> Option<BinaryOp> {
        match self.peek() {
            Some(Token::Op(op)) if allowed.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), TemplateError> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn nested<T>(
        &mut self,
        rule: impl FnOnce(&mut Self) -> Result<T, TemplateError>,
    ) -> Result<T, TemplateError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("formula is nested too deeply"));
        }
        self.depth += 1;
        let result = rule(self);
        self.depth -= 1;
        result
    }

    fn comparison(&mut self) -> Result<Expr, TemplateError> {
        self.nested(Self::comparison_inner)
    }

    fn comparison_inner(&mut self) -> Result<Expr, TemplateError> {
        let lhs = self.sum()?;
        let comparisons = [
            BinaryOp::Lt,
            BinaryOp::Le,
            BinaryOp::Gt,
            BinaryOp::Ge,
            BinaryOp::Eq,
            BinaryOp::Ne,
        ];
        match self.next_op(&comparisons) {
            Some(op) => Ok(Expr::Binary(op, Box::new(lhs), Box::new(self.sum()?))),
            None => Ok(lhs),
        }
    }

    fn sum(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.product()?;
        while let Some(op) = self.next_op(&[BinaryOp::Add, BinaryOp::Sub]) {
            expr = Expr::Binary(op, Box::new(expr), Box::new(self.product()?));
        }
        Ok(expr)
    }

    fn product(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.unary()?;
        while let Some(op) = self.next_op(&[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Rem]) {
            expr = Expr::Binary(op, Box::new(expr), Box::new(self.unary()?));
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr, TemplateError> {
        match self.next_op(&[BinaryOp::Add, BinaryOp::Sub]) {
            Some(BinaryOp::Sub) => Ok(Expr::Neg(Box::new(self.nested(Self::unary)?))),
            Some(_) => self.nested(Self::unary),
            None => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, TemplateError> {
        let base = self.primary()?;
        match self.next_op(&[BinaryOp::Pow]) {
            Some(op) => Ok(Expr::Binary(
                op,
                Box::new(base),
                Box::new(self.nested(Self::unary)?),
            )),
            None => Ok(base),
        }
    }

    fn primary(&mut self) -> Result<Expr, TemplateError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| self.error("unexpected end of formula"))?;
        self.pos += 1;

        match token {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::LParen => {
                let inner = self.comparison()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) if self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                let function = Function::lookup(&name)
                    .ok_or_else(|| TemplateError::UnknownFunction(name.clone()))?;
                let args = self.arguments()?;
                if !function.accepts(args.len()) {
                    return Err(TemplateError::Arity {
                        name,
                        given: args.len(),
                    });
                }
                Ok(Expr::Call(function, args))
            }
            Token::Ident(name) => Variable::lookup(&name)
                .map(Expr::Var)
                .ok_or(TemplateError::UnknownVariable(name)),
            _ => {
                self.pos -= 1;
                Err(self.error("expected a value"))
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, TemplateError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.comparison()?);
            match self.peek() {
                Some(Token::Comma) => self.pos += 1,
                Some(Token::RParen) => {
                    self.pos += 1;
                    return Ok(args);
                }
                _ => return Err(self.error("expected ',' or ')'")),
            }
        }
    }
}

/// A compiled formula. The empty template passes the raw value through.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Template {
    source: String,
    expr: Option<Expr>,
}

impl Template {
    pub fn compile(source: &str) -> Result<Self, TemplateError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }

        let tokens = tokenize(trimmed)?;
        if tokens.len() > MAX_TOKENS {
            return Err(TemplateError::Syntax {
                position: tokens[MAX_TOKENS].0,
                message: format!("formula is longer than {} tokens", MAX_TOKENS),
            });
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: trimmed.len(),
            depth: 0,
        };
        let expr = parser.comparison()?;
        if parser.peek().is_some() {
            return Err(parser.error("unexpected trailing input"));
        }

        Ok(Self {
            source: trimmed.to_string(),
            expr: Some(expr),
        })
    }

    /// Compile and try the formula on a sample record, as done before a
    /// configuration is accepted.
    pub fn validate(source: &str) -> Result<Self, TemplateError> {
        let template = Self::compile(source)?;
        template.evaluate(Field::Fixing1Rate, &validation_sample())?;
        Ok(template)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_empty(&self) -> bool {
        self.expr.is_none()
    }

    /// Value of `field` for `record` after applying the formula.
    pub fn evaluate(&self, field: Field, record: &HourRecord) -> Result<f64, TemplateError> {
        let Some(expr) = &self.expr else {
            return Ok(field.get(record));
        };
        let value = expr.eval(record);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(TemplateError::NonFinite)
        }
    }
}

fn validation_sample() -> HourRecord {
    let time = DateTime::<FixedOffset>::parse_from_rfc3339("2000-01-01T00:00:00+00:00")
        .unwrap_or_default();
    HourRecord {
        time,
        fixing1_rate: 1.0,
        fixing1_volume: 0.5,
        fixing2_rate: 0.5,
        fixing2_volume: 0.5,
    }
}

/// One template per field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TemplateSet {
    pub fixing1_rate: Template,
    pub fixing1_volume: Template,
    pub fixing2_rate: Template,
    pub fixing2_volume: Template,
}

impl TemplateSet {
    pub fn get(&self, field: Field) -> &Template {
        match field {
            Field::Fixing1Rate => &self.fixing1_rate,
            Field::Fixing1Volume => &self.fixing1_volume,
            Field::Fixing2Rate => &self.fixing2_rate,
            Field::Fixing2Volume => &self.fixing2_volume,
        }
    }

    pub fn set(&mut self, field: Field, template: Template) {
        match field {
            Field::Fixing1Rate => self.fixing1_rate = template,
            Field::Fixing1Volume => self.fixing1_volume = template,
            Field::Fixing2Rate => self.fixing2_rate = template,
            Field::Fixing2Volume => self.fixing2_volume = template,
        }
    }

    pub fn is_identity(&self) -> bool {
        Field::ALL.iter().all(|f| self.get(*f).is_empty())
    }

    /// Apply all four formulas to the raw record. A formula that fails on a
    /// record keeps the raw value for that field.
    pub fn derive(&self, record: &HourRecord) -> HourRecord {
        Field::ALL.iter().fold(record.clone(), |derived, field| {
            let template = self.get(*field);
            match template.evaluate(*field, record) {
                Ok(value) => derived.with_field(*field, value),
                Err(e) => {
                    tracing::warn!(
                        "Template for {} failed at {}: {}, keeping raw value",
                        field.key(),
                        record.time,
                        e
                    );
                    derived
                }
            }
        })
    }
}
