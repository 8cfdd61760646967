//! Small typed expression language shared by computed columns, select
//! predicates and parameterized balancer metrics.
//!
//! Expressions are parsed once into an [`Expr`] tree with column references
//! already bound to positions in the row they will be evaluated against;
//! evaluation never touches the source text again.

use xxhash_rust::xxh64::xxh64;

use crate::datum::Value;
use crate::error::{TabulaError, TabulaResult, ValidationError};
use crate::schema::ColumnType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    FarmHash,
    IsNull,
    Int64,
    Uint64,
    Double,
}

impl Function {
    fn lookup(name: &str) -> Option<Function> {
        match name {
            "farm_hash" => Some(Function::FarmHash),
            "is_null" => Some(Function::IsNull),
            "int64" => Some(Function::Int64),
            "uint64" => Some(Function::Uint64),
            "double" => Some(Function::Double),
            _ => None,
        }
    }

    fn arity(self) -> Option<usize> {
        match self {
            Function::FarmHash => None,
            _ => Some(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Column { index: usize, name: String },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
    In(Box<Expr>, Vec<Value>),
}

/// A parsed expression together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parse `source`, binding every column name through `resolve`.
    pub fn parse(source: &str, resolve: &dyn Fn(&str) -> Option<usize>) -> TabulaResult<Self> {
        let fail = |reason: String| -> TabulaError {
            ValidationError::Expression {
                expression: source.to_string(),
                reason,
            }
            .into()
        };
        let tokens = tokenize(source).map_err(fail)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            resolve,
        };
        let root = parser.parse_or().map_err(fail)?;
        if parser.pos != parser.tokens.len() {
            return Err(fail(format!("unexpected trailing token at {}", parser.pos)));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Positions of all referenced columns, in first-seen order.
    pub fn referenced_columns(&self) -> Vec<usize> {
        let mut out = Vec::new();
        collect_columns(&self.root, &mut out);
        out
    }

    pub fn eval(&self, row: &[Value]) -> TabulaResult<Value> {
        eval(&self.root, row)
    }

    /// Evaluate as a filter: anything but `true` rejects the row.
    pub fn matches(&self, row: &[Value]) -> TabulaResult<bool> {
        Ok(matches!(self.eval(row)?, Value::Boolean(true)))
    }

    /// Static result type given the types of the bound columns.
    pub fn infer_type(&self, column_types: &[ColumnType]) -> TabulaResult<ColumnType> {
        infer(&self.root, column_types).map_err(|reason| {
            ValidationError::Expression {
                expression: self.source.clone(),
                reason,
            }
            .into()
        })
    }
}

fn collect_columns(expr: &Expr, out: &mut Vec<usize>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Column { index, .. } => {
            if !out.contains(index) {
                out.push(*index);
            }
        }
        Expr::Unary(_, e) | Expr::In(e, _) => collect_columns(e, out),
        Expr::Binary(_, l, r) => {
            collect_columns(l, out);
            collect_columns(r, out);
        }
        Expr::Call(_, args) => args.iter().for_each(|a| collect_columns(a, out)),
    }
}

// ── Evaluation ────────────────────────────────────────────────────────

fn eval(expr: &Expr, row: &[Value]) -> TabulaResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column { index, name } => row
            .get(*index)
            .cloned()
            .ok_or_else(|| TabulaError::internal(format!("column {name} not bound"))),
        Expr::Unary(UnaryOp::Neg, e) => match eval(e, row)? {
            Value::Int64(v) => Ok(Value::Int64(v.wrapping_neg())),
            Value::Double(v) => Ok(Value::Double(-v)),
            Value::Null => Ok(Value::Null),
            other => Err(TabulaError::invalid_row(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        },
        Expr::Unary(UnaryOp::Not, e) => Ok(match eval(e, row)? {
            Value::Boolean(b) => Value::Boolean(!b),
            _ => Value::Null,
        }),
        Expr::Binary(BinaryOp::And, l, r) => {
            let l = truthy(&eval(l, row)?);
            Ok(Value::Boolean(l && truthy(&eval(r, row)?)))
        }
        Expr::Binary(BinaryOp::Or, l, r) => {
            let l = truthy(&eval(l, row)?);
            Ok(Value::Boolean(l || truthy(&eval(r, row)?)))
        }
        Expr::Binary(op, l, r) => {
            let l = eval(l, row)?;
            let r = eval(r, row)?;
            if op.is_arithmetic() {
                arithmetic(*op, l, r)
            } else {
                Ok(compare(*op, &l, &r))
            }
        }
        Expr::Call(func, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, row))
                .collect::<TabulaResult<Vec<_>>>()?;
            call(*func, values)
        }
        Expr::In(e, list) => {
            let v = eval(e, row)?;
            if v.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::Boolean(list.iter().any(|item| {
                matches!(compare(BinaryOp::Eq, &v, item), Value::Boolean(true))
            })))
        }
    }
}

fn truthy(v: &Value) -> bool {
    matches!(v, Value::Boolean(true))
}

fn arithmetic(op: BinaryOp, l: Value, r: Value) -> TabulaResult<Value> {
    let div_zero = || TabulaError::invalid_row("division by zero");
    match (l, r) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Int64(a), Value::Int64(b)) => Ok(Value::Int64(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => a.checked_div(b).ok_or_else(div_zero)?,
            _ => a.checked_rem(b).ok_or_else(div_zero)?,
        })),
        (Value::Uint64(a), Value::Uint64(b)) => Ok(Value::Uint64(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => a.checked_div(b).ok_or_else(div_zero)?,
            _ => a.checked_rem(b).ok_or_else(div_zero)?,
        })),
        (l, r) => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Double(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            })),
            _ => Err(TabulaError::invalid_row(format!(
                "arithmetic on {} and {}",
                l.type_name(),
                r.type_name()
            ))),
        },
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Value {
    if l.is_null() || r.is_null() {
        return Value::Null;
    }
    let ord = match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) if l.type_name() != r.type_name() => a.total_cmp(&b),
        _ => l.cmp(r),
    };
    Value::Boolean(match op {
        BinaryOp::Eq => ord.is_eq(),
        BinaryOp::Ne => ord.is_ne(),
        BinaryOp::Lt => ord.is_lt(),
        BinaryOp::Le => ord.is_le(),
        BinaryOp::Gt => ord.is_gt(),
        _ => ord.is_ge(),
    })
}

fn call(func: Function, args: Vec<Value>) -> TabulaResult<Value> {
    match func {
        Function::FarmHash => {
            let mut buf = Vec::new();
            for a in &args {
                a.encode_into(&mut buf);
            }
            Ok(Value::Uint64(xxh64(&buf, 0)))
        }
        Function::IsNull => Ok(Value::Boolean(args[0].is_null())),
        Function::Int64 => Ok(match &args[0] {
            Value::Int64(v) => Value::Int64(*v),
            Value::Uint64(v) => Value::Int64(*v as i64),
            Value::Double(v) => Value::Int64(*v as i64),
            Value::Boolean(b) => Value::Int64(i64::from(*b)),
            _ => Value::Null,
        }),
        Function::Uint64 => Ok(match &args[0] {
            Value::Int64(v) => Value::Uint64(*v as u64),
            Value::Uint64(v) => Value::Uint64(*v),
            Value::Double(v) => Value::Uint64(*v as u64),
            Value::Boolean(b) => Value::Uint64(u64::from(*b)),
            _ => Value::Null,
        }),
        Function::Double => Ok(args[0].as_f64().map_or(Value::Null, Value::Double)),
    }
}

// ── Type inference ────────────────────────────────────────────────────

fn literal_type(v: &Value) -> ColumnType {
    match v {
        Value::Null => ColumnType::Any,
        Value::Int64(_) => ColumnType::Int64,
        Value::Uint64(_) => ColumnType::Uint64,
        Value::Double(_) => ColumnType::Double,
        Value::Boolean(_) => ColumnType::Boolean,
        Value::String(_) => ColumnType::String,
    }
}

fn infer(expr: &Expr, types: &[ColumnType]) -> Result<ColumnType, String> {
    match expr {
        Expr::Literal(v) => Ok(literal_type(v)),
        Expr::Column { index, name } => types
            .get(*index)
            .copied()
            .ok_or_else(|| format!("column {name} has no type")),
        Expr::Unary(UnaryOp::Neg, e) => infer(e, types),
        Expr::Unary(UnaryOp::Not, _) | Expr::In(..) => Ok(ColumnType::Boolean),
        Expr::Binary(op, l, r) => {
            let (lt, rt) = (infer(l, types)?, infer(r, types)?);
            if !op.is_arithmetic() {
                return Ok(ColumnType::Boolean);
            }
            match (lt, rt) {
                (ColumnType::Any, t) | (t, ColumnType::Any) => Ok(t),
                (a, b) if a == b && a.is_numeric() => Ok(a),
                (a, b) => Err(format!("type mismatch in arithmetic: {a} and {b}")),
            }
        }
        Expr::Call(func, _) => Ok(match func {
            Function::FarmHash | Function::Uint64 => ColumnType::Uint64,
            Function::IsNull => ColumnType::Boolean,
            Function::Int64 => ColumnType::Int64,
            Function::Double => ColumnType::Double,
        }),
    }
}

// ── Lexer ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Uint(u64),
    Double(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let bad = || format!("bad number literal {text:?}");
            if i < chars.len() && chars[i] == 'u' {
                i += 1;
                out.push(Token::Uint(text.parse().map_err(|_| bad())?));
            } else if text.contains('.') {
                out.push(Token::Double(text.parse().map_err(|_| bad())?));
            } else {
                out.push(Token::Int(text.parse().map_err(|_| bad())?));
            }
            continue;
        }
        if c == '\'' || c == '"' {
            let start = i + 1;
            let end = chars[start..]
                .iter()
                .position(|&ch| ch == c)
                .map(|p| start + p)
                .ok_or("unterminated string literal")?;
            out.push(Token::Str(chars[start..end].iter().collect()));
            i = end + 1;
            continue;
        }
        if c == '[' {
            let start = i + 1;
            let end = chars[start..]
                .iter()
                .position(|&ch| ch == ']')
                .map(|p| start + p)
                .ok_or("unterminated [name]")?;
            let name: String = chars[start..end].iter().collect();
            out.push(Token::Ident(name.trim().to_string()));
            i = end + 1;
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            out.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            ('+', _) => (Token::Op("+"), 1),
            ('-', _) => (Token::Op("-"), 1),
            ('*', _) => (Token::Op("*"), 1),
            ('/', _) => (Token::Op("/"), 1),
            ('%', _) => (Token::Op("%"), 1),
            ('=', Some('=')) => (Token::Op("="), 2),
            ('=', _) => (Token::Op("="), 1),
            ('!', Some('=')) | ('<', Some('>')) => (Token::Op("!="), 2),
            ('<', Some('=')) => (Token::Op("<="), 2),
            ('<', _) => (Token::Op("<"), 1),
            ('>', Some('=')) => (Token::Op(">="), 2),
            ('>', _) => (Token::Op(">"), 1),
            _ => return Err(format!("unexpected character {c:?}")),
        };
        out.push(token);
        i += width;
    }
    Ok(out)
}

// ── Parser ────────────────────────────────────────────────────────────

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    resolve: &'a dyn Fn(&str) -> Option<usize>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(format!("expected {token:?}, found {other:?}")),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.peek_keyword("not") {
            self.pos += 1;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_additive()?;
        if self.peek_keyword("in") {
            self.pos += 1;
            return self.parse_in_list(left);
        }
        let op = match self.peek() {
            Some(Token::Op("=")) => BinaryOp::Eq,
            Some(Token::Op("!=")) => BinaryOp::Ne,
            Some(Token::Op("<")) => BinaryOp::Lt,
            Some(Token::Op("<=")) => BinaryOp::Le,
            Some(Token::Op(">")) => BinaryOp::Gt,
            Some(Token::Op(">=")) => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_in_list(&mut self, subject: Expr) -> Result<Expr, String> {
        self.expect(Token::LParen)?;
        let mut values = Vec::new();
        loop {
            match self.parse_additive()? {
                Expr::Literal(v) => values.push(v),
                Expr::Unary(UnaryOp::Neg, inner) => match *inner {
                    Expr::Literal(Value::Int64(v)) => values.push(Value::Int64(-v)),
                    Expr::Literal(Value::Double(v)) => values.push(Value::Double(-v)),
                    _ => return Err("IN list accepts literals only".to_string()),
                },
                _ => return Err("IN list accepts literals only".to_string()),
            }
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                other => return Err(format!("expected , or ) in IN list, found {other:?}")),
            }
        }
        Ok(Expr::In(Box::new(subject), values))
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => BinaryOp::Add,
                Some(Token::Op("-")) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => BinaryOp::Mul,
                Some(Token::Op("/")) => BinaryOp::Div,
                Some(Token::Op("%")) => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Op("-"))) {
            self.pos += 1;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Int(v)) => Ok(Expr::Literal(Value::Int64(v))),
            Some(Token::Uint(v)) => Ok(Expr::Literal(Value::Uint64(v))),
            Some(Token::Double(v)) => Ok(Expr::Literal(Value::Double(v))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.to_ascii_lowercase().as_str() {
                "true" => Ok(Expr::Literal(Value::Boolean(true))),
                "false" => Ok(Expr::Literal(Value::Boolean(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if matches!(self.peek(), Some(Token::LParen)) => self.parse_call(&name),
                _ => {
                    let index = (self.resolve)(&name)
                        .ok_or_else(|| format!("unknown column {name:?}"))?;
                    Ok(Expr::Column { index, name })
                }
            },
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Expr, String> {
        let func = Function::lookup(name).ok_or_else(|| format!("unknown function {name:?}"))?;
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.pos += 1;
        } else {
            loop {
                args.push(self.parse_or()?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    other => return Err(format!("expected , or ) in call, found {other:?}")),
                }
            }
        }
        match func.arity() {
            Some(n) if n != args.len() => {
                Err(format!("{name} expects {n} argument(s), got {}", args.len()))
            }
            None if args.is_empty() => Err(format!("{name} expects at least one argument")),
            _ => Ok(Expr::Call(func, args)),
        }
    }
}
