//! Formula evaluation for the cells an import reads
//!
//! A workbook written by a generator or saved without recalculation can hold
//! formulas with no cached value. The evaluator recomputes them from the
//! sheet: arithmetic, text and comparison operators, same-sheet references
//! and areas, and a small set of worksheet functions. Anything else is an
//! error that the caller may answer with the cached value.

use super::coerce::render_number;
use calamine::{Data, Range};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

const MAX_ROWS: u32 = 1_048_576;
const MAX_COLS: u32 = 16_384;
/// Longest chain of formulas referring to formulas, and deepest nesting inside one formula
const MAX_DEPTH: usize = 64;
const MAX_AREA_CELLS: u64 = 65_536;

const UNARY_PRECEDENCE: u8 = 6;

/// Zero-based cell position written as an A1 reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    /// Parse `B7`, `$B$7` and the mixed forms
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.strip_prefix('$').unwrap_or(text);
        let letters = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()).len();
        if letters == 0 || letters > 3 {
            return None;
        }
        let (column, rest) = rest.split_at(letters);
        let digits = rest.strip_prefix('$').unwrap_or(rest);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let row: u32 = digits.parse().ok()?;
        let col = column
            .bytes()
            .fold(0, |acc, b| acc * 26 + u32::from(b.to_ascii_uppercase() - b'A') + 1)
            - 1;
        if row == 0 || row > MAX_ROWS || col >= MAX_COLS {
            return None;
        }
        Some(Self { row: row - 1, col })
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut letters = Vec::new();
        let mut col = self.col;
        loop {
            letters.push(char::from(b'A' + (col % 26) as u8));
            if col < 26 {
                break;
            }
            col = col / 26 - 1;
        }
        letters.iter().rev().try_for_each(|c| write!(f, "{}", c))?;
        write!(f, "{}", self.row + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Negate,
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Concat,
    Equals,
    NotEquals,
    Less,
    LessEquals,
    Greater,
    GreaterEquals,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    Boolean(bool),
    Ref(CellRef),
    Area(CellRef, CellRef),
    Call { name: String, args: Vec<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Ampersand,
    Percent,
    Equals,
    NotEquals,
    Less,
    LessEquals,
    Greater,
    GreaterEquals,
    Eof,
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    /// Token list that always ends with [`Token::Eof`]
    fn tokenize(input: &'a str) -> Result<Vec<Token>, String> {
        let mut lexer = Self { input, pos: 0 };
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat_while(&mut self, keep: impl Fn(char) -> bool) {
        while self.peek().is_some_and(&keep) {
            self.bump();
        }
    }

    fn next_token(&mut self) -> Result<Token, String> {
        self.eat_while(char::is_whitespace);
        let start = self.pos;
        let Some(c) = self.bump() else {
            return Ok(Token::Eof);
        };
        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            ':' => Token::Colon,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '^' => Token::Caret,
            '&' => Token::Ampersand,
            '%' => Token::Percent,
            '=' => Token::Equals,
            '<' => match self.peek() {
                Some('=') => {
                    self.bump();
                    Token::LessEquals
                }
                Some('>') => {
                    self.bump();
                    Token::NotEquals
                }
                _ => Token::Less,
            },
            '>' => match self.peek() {
                Some('=') => {
                    self.bump();
                    Token::GreaterEquals
                }
                _ => Token::Greater,
            },
            '"' => self.text()?,
            c if c.is_ascii_digit() || c == '.' => self.number(start)?,
            c if c.is_alphabetic() || c == '$' || c == '_' => {
                self.eat_while(|c| c.is_alphanumeric() || matches!(c, '$' | '_' | '.'));
                Token::Ident(self.input[start..self.pos].to_string())
            }
            other => return Err(format!("unexpected character '{}'", other)),
        };
        Ok(token)
    }

    fn number(&mut self, start: usize) -> Result<Token, String> {
        self.eat_while(|c| c.is_ascii_digit() || c == '.');
        if matches!(self.peek(), Some('e' | 'E')) {
            let exponent = &self.input[self.pos + 1..];
            let sign = usize::from(exponent.starts_with(['+', '-']));
            if exponent[sign..].starts_with(|c: char| c.is_ascii_digit()) {
                self.pos += 1 + sign;
                self.eat_while(|c| c.is_ascii_digit());
            }
        }
        let text = &self.input[start..self.pos];
        text.parse()
            .map(Token::Number)
            .map_err(|_| format!("'{}' is not a number", text))
    }

    fn text(&mut self) -> Result<Token, String> {
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') if self.peek() == Some('"') => {
                    self.bump();
                    value.push('"');
                }
                Some('"') => return Ok(Token::Text(value)),
                Some(c) => value.push(c),
                None => return Err("unterminated string literal".to_string()),
            }
        }
    }
}

fn binary_op(token: &Token) -> Option<(BinaryOp, u8)> {
    let op = match token {
        Token::Equals => (BinaryOp::Equals, 1),
        Token::NotEquals => (BinaryOp::NotEquals, 1),
        Token::Less => (BinaryOp::Less, 1),
        Token::LessEquals => (BinaryOp::LessEquals, 1),
        Token::Greater => (BinaryOp::Greater, 1),
        Token::GreaterEquals => (BinaryOp::GreaterEquals, 1),
        Token::Ampersand => (BinaryOp::Concat, 2),
        Token::Plus => (BinaryOp::Add, 3),
        Token::Minus => (BinaryOp::Subtract, 3),
        Token::Star => (BinaryOp::Multiply, 4),
        Token::Slash => (BinaryOp::Divide, 4),
        Token::Caret => (BinaryOp::Power, 5),
        _ => return None,
    };
    Some(op)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

/// Parse formula text, with or without its leading `=`
pub fn parse(formula: &str) -> Result<Expr, String> {
    let body = formula.trim_start();
    let body = body.strip_prefix('=').unwrap_or(body);
    let mut parser = Parser {
        tokens: Lexer::tokenize(body)?,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_expr(0)?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        other => Err(format!("unexpected {:?} after the expression", other)),
    }
}

impl Parser {
    fn peek(&self) -> &Token {
        // the list ends with Eof and the cursor never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, String>) -> Result<T, String> {
        if self.depth >= MAX_DEPTH {
            return Err("formula is nested too deeply".to_string());
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn parse_expr(&mut self, min_precedence: u8) -> Result<Expr, String> {
        let mut left = self.parse_prefix()?;
        loop {
            if *self.peek() == Token::Percent {
                self.advance();
                left = Expr::Unary {
                    op: UnaryOp::Percent,
                    expr: Box::new(left),
                };
                continue;
            }
            let Some((op, precedence)) = binary_op(self.peek()) else {
                break;
            };
            if precedence < min_precedence {
                break;
            }
            self.advance();
            let right = self.nested(|p| p.parse_expr(precedence + 1))?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_prefix(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Text(s) => Ok(Expr::Text(s)),
            Token::Minus => self.unary(UnaryOp::Negate),
            Token::Plus => self.unary(UnaryOp::Plus),
            Token::LParen => {
                let inner = self.nested(|p| p.parse_expr(0))?;
                match self.advance() {
                    Token::RParen => Ok(inner),
                    other => Err(format!("expected ')', found {:?}", other)),
                }
            }
            Token::Ident(name) => self.parse_name(name),
            other => Err(format!("unexpected {:?}", other)),
        }
    }

    fn unary(&mut self, op: UnaryOp) -> Result<Expr, String> {
        let expr = self.nested(|p| p.parse_expr(UNARY_PRECEDENCE))?;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_name(&mut self, name: String) -> Result<Expr, String> {
        if *self.peek() == Token::LParen {
            self.advance();
            let args = self.nested(Self::parse_args)?;
            return Ok(Expr::Call {
                name: name.to_ascii_uppercase(),
                args,
            });
        }
        if name.eq_ignore_ascii_case("TRUE") {
            return Ok(Expr::Boolean(true));
        }
        if name.eq_ignore_ascii_case("FALSE") {
            return Ok(Expr::Boolean(false));
        }

        let start = CellRef::parse(&name).ok_or_else(|| format!("unknown name '{}'", name))?;
        if *self.peek() != Token::Colon {
            return Ok(Expr::Ref(start));
        }
        self.advance();
        match self.advance() {
            Token::Ident(end) => {
                let end = CellRef::parse(&end).ok_or_else(|| format!("unknown name '{}'", end))?;
                Ok(Expr::Area(start, end))
            }
            other => Err(format!("expected a cell after ':', found {:?}", other)),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if *self.peek() == Token::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr(0)?);
            match self.advance() {
                Token::Comma => {}
                Token::RParen => return Ok(args),
                other => return Err(format!("expected ',' or ')', found {:?}", other)),
            }
        }
    }
}

/// Result of evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
    Boolean(bool),
    Empty,
}

impl Value {
    fn from_data(data: &Data) -> Result<Self, String> {
        match data {
            Data::Empty => Ok(Value::Empty),
            Data::Float(f) => Ok(Value::Number(*f)),
            Data::Int(i) => Ok(Value::Number(*i as f64)),
            Data::Bool(b) => Ok(Value::Boolean(*b)),
            Data::DateTime(dt) => Ok(Value::Number(dt.as_f64())),
            Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => {
                Ok(Value::Text(s.clone()))
            }
            Data::Error(e) => Err(format!("referenced cell holds error value {:?}", e)),
        }
    }

    /// The value a formula leaves in its cell; an empty result reads as zero
    fn into_data(self) -> Data {
        match self {
            Value::Number(n) => Data::Float(n),
            Value::Text(s) => Data::String(s),
            Value::Boolean(b) => Data::Bool(b),
            Value::Empty => Data::Float(0.0),
        }
    }

    fn to_number(&self) -> Result<f64, String> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Empty => Ok(0.0),
            Value::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("#VALUE!: '{}' is not a number", s)),
        }
    }

    fn to_text(&self) -> String {
        match self {
            Value::Number(n) => render_number(*n),
            Value::Text(s) => s.clone(),
            Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Value::Empty => String::new(),
        }
    }

    fn to_bool(&self) -> Result<bool, String> {
        match self {
            Value::Boolean(b) => Ok(*b),
            Value::Number(n) => Ok(*n != 0.0),
            Value::Empty => Ok(false),
            Value::Text(s) if s.eq_ignore_ascii_case("TRUE") => Ok(true),
            Value::Text(s) if s.eq_ignore_ascii_case("FALSE") => Ok(false),
            Value::Text(s) => Err(format!("#VALUE!: '{}' is not a logical value", s)),
        }
    }
}

fn finite(n: f64) -> Result<Value, String> {
    if n.is_finite() {
        Ok(Value::Number(n))
    } else {
        Err("#NUM!".to_string())
    }
}

/// Excel ordering: numbers before text before logicals, text without case
fn ordering(left: &Value, right: &Value) -> Ordering {
    fn fill(value: &Value, other: &Value) -> Value {
        match (value, other) {
            (Value::Empty, Value::Text(_)) => Value::Text(String::new()),
            (Value::Empty, Value::Boolean(_)) => Value::Boolean(false),
            (Value::Empty, _) => Value::Number(0.0),
            _ => value.clone(),
        }
    }
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Number(_) | Value::Empty => 0,
            Value::Text(_) => 1,
            Value::Boolean(_) => 2,
        }
    }

    let (l, r) = (fill(left, right), fill(right, left));
    match (&l, &r) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        (Value::Text(a), Value::Text(b)) => a.to_lowercase().cmp(&b.to_lowercase()),
        (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
        _ => rank(&l).cmp(&rank(&r)),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, String> {
    let number = match op {
        BinaryOp::Concat => return Ok(Value::Text(left.to_text() + &right.to_text())),
        BinaryOp::Add => left.to_number()? + right.to_number()?,
        BinaryOp::Subtract => left.to_number()? - right.to_number()?,
        BinaryOp::Multiply => left.to_number()? * right.to_number()?,
        BinaryOp::Divide => {
            let dividend = left.to_number()?;
            let divisor = right.to_number()?;
            if divisor == 0.0 {
                return Err("#DIV/0!".to_string());
            }
            dividend / divisor
        }
        BinaryOp::Power => left.to_number()?.powf(right.to_number()?),
        comparison => {
            let order = ordering(&left, &right);
            let holds = match comparison {
                BinaryOp::Equals => order == Ordering::Equal,
                BinaryOp::NotEquals => order != Ordering::Equal,
                BinaryOp::Less => order == Ordering::Less,
                BinaryOp::LessEquals => order != Ordering::Greater,
                BinaryOp::Greater => order == Ordering::Greater,
                _ => order != Ordering::Less,
            };
            return Ok(Value::Boolean(holds));
        }
    };
    finite(number)
}

/// Round half away from zero on the shortest decimal rendering of `value`
fn round(value: f64, digits: f64) -> Result<Value, String> {
    let digits = digits.trunc();
    if digits < 0.0 {
        let factor = 10f64.powf(-digits);
        return finite((value / factor).round() * factor);
    }
    match Decimal::from_str(&value.to_string()) {
        Ok(decimal) => decimal
            .round_dp_with_strategy(digits.min(28.0) as u32, RoundingStrategy::MidpointAwayFromZero)
            .to_f64()
            .map(Value::Number)
            .ok_or_else(|| "#NUM!".to_string()),
        // too large for a decimal, so there is no fraction to round
        Err(_) => finite(value),
    }
}

fn arity(name: &str, args: &[Expr], min: usize, max: usize) -> Result<(), String> {
    if (min..=max).contains(&args.len()) {
        Ok(())
    } else {
        Err(format!("{} takes {} to {} arguments, got {}", name, min, max, args.len()))
    }
}

/// Evaluates the formulas of one sheet against its cached values
pub struct Evaluator<'a> {
    values: &'a Range<Data>,
    formulas: &'a Range<String>,
    /// Cells whose formula is being evaluated, innermost last
    stack: Vec<CellRef>,
}

impl<'a> Evaluator<'a> {
    pub fn new(values: &'a Range<Data>, formulas: &'a Range<String>) -> Self {
        Self {
            values,
            formulas,
            stack: Vec::new(),
        }
    }

    fn formula_at(&self, at: CellRef) -> Option<&'a str> {
        let formulas: &'a Range<String> = self.formulas;
        formulas
            .get_value((at.row, at.col))
            .map(String::as_str)
            .filter(|f| !f.trim().is_empty())
    }

    fn cached_at(&self, at: CellRef) -> Option<&'a Data> {
        let values: &'a Range<Data> = self.values;
        values
            .get_value((at.row, at.col))
            .filter(|d| !matches!(d, Data::Empty))
    }

    /// Value of a cell as the import sees it.
    ///
    /// A formula cell is recomputed. When that fails the cached value is
    /// used, and a formula with neither is an error. Other cells yield their
    /// cached value.
    pub fn cell(&mut self, at: CellRef) -> Result<Option<Data>, String> {
        let cached = self.cached_at(at);
        let Some(formula) = self.formula_at(at) else {
            return Ok(cached.cloned());
        };
        match self.evaluate_formula(at, formula) {
            Ok(value) => Ok(Some(value.into_data())),
            Err(error) => match cached {
                Some(value) => {
                    log::debug!(
                        "formula {} at {} not evaluated ({}); using its cached value",
                        formula,
                        at,
                        error
                    );
                    Ok(Some(value.clone()))
                }
                None => Err(format!(
                    "formula {} has no cached value and could not be evaluated: {}",
                    formula, error
                )),
            },
        }
    }

    fn reference(&mut self, at: CellRef) -> Result<Value, String> {
        let cached = self.cached_at(at);
        let Some(formula) = self.formula_at(at) else {
            return cached.map_or(Ok(Value::Empty), Value::from_data);
        };
        match (self.evaluate_formula(at, formula), cached) {
            (Ok(value), _) => Ok(value),
            (Err(error), None) => Err(format!("{}: {}", at, error)),
            (Err(_), Some(data)) => Value::from_data(data),
        }
    }

    fn evaluate_formula(&mut self, at: CellRef, formula: &str) -> Result<Value, String> {
        if self.stack.contains(&at) {
            return Err(format!("circular reference through {}", at));
        }
        if self.stack.len() >= MAX_DEPTH {
            return Err("formulas refer to each other too deeply".to_string());
        }
        let expr = parse(formula)?;
        self.stack.push(at);
        let value = self.eval(&expr);
        self.stack.pop();
        value
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value, String> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Text(s) => Ok(Value::Text(s.clone())),
            Expr::Boolean(b) => Ok(Value::Boolean(*b)),
            Expr::Ref(at) => self.reference(*at),
            Expr::Area(..) => Err("#VALUE!: a range is not a single value".to_string()),
            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOp::Plus => Ok(value),
                    UnaryOp::Negate => finite(-value.to_number()?),
                    UnaryOp::Percent => finite(value.to_number()? / 100.0),
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, left, right)
            }
            Expr::Call { name, args } => self.call(name, args),
        }
    }

    fn call(&mut self, name: &str, args: &[Expr]) -> Result<Value, String> {
        match name {
            "SUM" => finite(self.numbers(args)?.iter().sum()),
            "PRODUCT" => finite(self.numbers(args)?.iter().product()),
            "MIN" => {
                let numbers = self.numbers(args)?;
                finite(numbers.iter().copied().reduce(f64::min).unwrap_or(0.0))
            }
            "MAX" => {
                let numbers = self.numbers(args)?;
                finite(numbers.iter().copied().reduce(f64::max).unwrap_or(0.0))
            }
            "AVERAGE" => {
                let numbers = self.numbers(args)?;
                if numbers.is_empty() {
                    return Err("#DIV/0!".to_string());
                }
                finite(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
            "ROUND" => {
                arity(name, args, 2, 2)?;
                let value = self.eval(&args[0])?.to_number()?;
                let digits = self.eval(&args[1])?.to_number()?;
                round(value, digits)
            }
            "ABS" => {
                arity(name, args, 1, 1)?;
                finite(self.eval(&args[0])?.to_number()?.abs())
            }
            "INT" => {
                arity(name, args, 1, 1)?;
                finite(self.eval(&args[0])?.to_number()?.floor())
            }
            "IF" => {
                arity(name, args, 2, 3)?;
                if self.eval(&args[0])?.to_bool()? {
                    self.eval(&args[1])
                } else {
                    args.get(2)
                        .map_or(Ok(Value::Boolean(false)), |otherwise| self.eval(otherwise))
                }
            }
            "CONCATENATE" => {
                let mut text = String::new();
                for arg in args {
                    text.push_str(&self.eval(arg)?.to_text());
                }
                Ok(Value::Text(text))
            }
            other => Err(format!("unsupported function {}", other)),
        }
    }

    /// Numeric arguments of an aggregate function.
    ///
    /// Referenced text, logicals and blanks are skipped; direct arguments are
    /// coerced like operands.
    fn numbers(&mut self, args: &[Expr]) -> Result<Vec<f64>, String> {
        let mut numbers = Vec::new();
        for arg in args {
            match arg {
                Expr::Ref(at) => {
                    if let Value::Number(n) = self.reference(*at)? {
                        numbers.push(n);
                    }
                }
                Expr::Area(from, to) => {
                    for at in area_cells(*from, *to)? {
                        if let Value::Number(n) = self.reference(at)? {
                            numbers.push(n);
                        }
                    }
                }
                other => numbers.push(self.eval(other)?.to_number()?),
            }
        }
        Ok(numbers)
    }
}

fn area_cells(from: CellRef, to: CellRef) -> Result<Vec<CellRef>, String> {
    let (top, bottom) = (from.row.min(to.row), from.row.max(to.row));
    let (left, right) = (from.col.min(to.col), from.col.max(to.col));
    let count = u64::from(bottom - top + 1) * u64::from(right - left + 1);
    if count > MAX_AREA_CELLS {
        return Err(format!("range {}:{} has too many cells", from, to));
    }
    Ok((top..=bottom)
        .flat_map(|row| (left..=right).map(move |col| CellRef { row, col }))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{Cell, CellErrorType};

    fn at(reference: &str) -> CellRef {
        CellRef::parse(reference).unwrap()
    }

    fn values(cells: &[(&str, Data)]) -> Range<Data> {
        Range::from_sparse(
            cells
                .iter()
                .map(|(r, d)| {
                    let p = at(r);
                    Cell::new((p.row, p.col), d.clone())
                })
                .collect(),
        )
    }

    fn formulas(cells: &[(&str, &str)]) -> Range<String> {
        Range::from_sparse(
            cells
                .iter()
                .map(|(r, f)| {
                    let p = at(r);
                    Cell::new((p.row, p.col), f.to_string())
                })
                .collect(),
        )
    }

    fn evaluate(text: &str, values: &Range<Data>, formulas: &Range<String>) -> Result<Value, String> {
        Evaluator::new(values, formulas).eval(&parse(text)?)
    }

    fn constant(text: &str) -> Result<Value, String> {
        evaluate(text, &Range::default(), &Range::default())
    }

    #[test]
    fn test_cell_ref_parse() {
        assert_eq!(at("A1"), CellRef { row: 0, col: 0 });
        assert_eq!(at("$B$7"), CellRef { row: 6, col: 1 });
        assert_eq!(at("aa10"), CellRef { row: 9, col: 26 });
        assert_eq!(at("XFD1048576"), CellRef { row: 1_048_575, col: 16_383 });
        assert_eq!(CellRef::parse("A0"), None);
        assert_eq!(CellRef::parse("XFE1"), None);
        assert_eq!(CellRef::parse("SUM"), None);
        assert_eq!(CellRef::parse("1A"), None);
        assert_eq!(at("AB12").to_string(), "AB12");
    }

    #[test]
    fn test_operator_precedence() {
        assert_eq!(constant("=1+2*3"), Ok(Value::Number(7.0)));
        assert_eq!(constant("(1+2)*3"), Ok(Value::Number(9.0)));
        assert_eq!(constant("-2^2"), Ok(Value::Number(4.0)));
        assert_eq!(constant("2^3^2"), Ok(Value::Number(64.0)));
        assert_eq!(constant("10-4-3"), Ok(Value::Number(3.0)));
        assert_eq!(constant("1+50%"), Ok(Value::Number(1.5)));
        assert_eq!(constant("1.5e2/3"), Ok(Value::Number(50.0)));
        assert_eq!(constant("1+2=3"), Ok(Value::Boolean(true)));
        assert_eq!(constant("\"a\"&1+1"), Ok(Value::Text("a2".to_string())));
    }

    #[test]
    fn test_references_and_areas() {
        let values = values(&[
            ("A1", Data::Float(2.0)),
            ("A2", Data::Float(3.0)),
            ("A3", Data::String("note".to_string())),
            ("B1", Data::Int(4)),
        ]);
        let formulas = formulas(&[]);
        assert_eq!(evaluate("A1*B1", &values, &formulas), Ok(Value::Number(8.0)));
        assert_eq!(evaluate("SUM(A1:A4)", &values, &formulas), Ok(Value::Number(5.0)));
        assert_eq!(evaluate("SUM($A$1:A2,10)", &values, &formulas), Ok(Value::Number(15.0)));
        assert_eq!(evaluate("AVERAGE(A1:B2)", &values, &formulas), Ok(Value::Number(3.0)));
        assert_eq!(evaluate("MAX(A1:B1)", &values, &formulas), Ok(Value::Number(4.0)));
        assert_eq!(evaluate("C9+1", &values, &formulas), Ok(Value::Number(1.0)));
        assert!(evaluate("A3*2", &values, &formulas).is_err());
    }

    #[test]
    fn test_functions() {
        assert_eq!(constant("ROUND(2.675,2)"), Ok(Value::Number(2.68)));
        assert_eq!(constant("ROUND(-2.5,0)"), Ok(Value::Number(-3.0)));
        assert_eq!(constant("ROUND(1234,-2)"), Ok(Value::Number(1200.0)));
        assert_eq!(constant("INT(-1.5)"), Ok(Value::Number(-2.0)));
        assert_eq!(constant("ABS(-3)"), Ok(Value::Number(3.0)));
        assert_eq!(constant("IF(1>2,\"yes\",\"no\")"), Ok(Value::Text("no".to_string())));
        assert_eq!(constant("IF(FALSE,1)"), Ok(Value::Boolean(false)));
        assert_eq!(
            constant("CONCATENATE(\"G0\",2,\" \"\"wear\"\"\")"),
            Ok(Value::Text("G02 \"wear\"".to_string()))
        );
        assert_eq!(constant("\"abc\"=\"ABC\""), Ok(Value::Boolean(true)));
    }

    #[test]
    fn test_errors() {
        assert_eq!(constant("1/0"), Err("#DIV/0!".to_string()));
        assert_eq!(constant("AVERAGE()"), Err("#DIV/0!".to_string()));
        assert_eq!(constant("VLOOKUP(1,A1:B2,2)"), Err("unsupported function VLOOKUP".to_string()));
        assert!(constant("ROUND(1)").is_err());
        assert!(constant("Sheet2!A1").is_err());
        assert!(constant("1+").is_err());
        assert!(constant("(1").is_err());
        assert!(constant("\"open").is_err());
        assert!(constant(&format!("{}1{}", "(".repeat(200), ")".repeat(200))).is_err());
    }

    #[test]
    fn test_cell_prefers_formula_over_cache() {
        let values = values(&[
            ("A1", Data::Float(2.0)),
            ("B1", Data::Float(99.0)),
            ("C1", Data::Float(7.0)),
        ]);
        let formulas = formulas(&[("B1", "A1*10"), ("C1", "VLOOKUP(A1,D1:E2,2)"), ("D1", "XLOOKUP(A1)")]);
        let mut evaluator = Evaluator::new(&values, &formulas);

        assert_eq!(evaluator.cell(at("B1")), Ok(Some(Data::Float(20.0))));
        assert_eq!(evaluator.cell(at("C1")), Ok(Some(Data::Float(7.0))));
        assert!(evaluator.cell(at("D1")).unwrap_err().contains("no cached value"));
        assert_eq!(evaluator.cell(at("A1")), Ok(Some(Data::Float(2.0))));
        assert_eq!(evaluator.cell(at("Z9")), Ok(None));
    }

    #[test]
    fn test_chained_formulas_and_cycles() {
        let values = values(&[("A1", Data::Float(1.0)), ("E1", Data::Error(CellErrorType::Div0))]);
        let formulas = formulas(&[
            ("B1", "A1+1"),
            ("C1", "B1*2"),
            ("D1", "D2+1"),
            ("D2", "D1+1"),
            ("F1", "E1+1"),
            ("G1", "H1"),
        ]);
        let mut evaluator = Evaluator::new(&values, &formulas);

        assert_eq!(evaluator.cell(at("C1")), Ok(Some(Data::Float(4.0))));
        assert!(evaluator.cell(at("D1")).unwrap_err().contains("circular"));
        assert!(evaluator.cell(at("F1")).is_err());
        // a formula over an empty cell leaves zero
        assert_eq!(evaluator.cell(at("G1")), Ok(Some(Data::Float(0.0))));
    }
}
