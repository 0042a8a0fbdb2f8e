//! Infix expressions used by rate laws, assignments and compartment sizes.
//!
//! Expressions are parsed once into an [`Expr`] tree, renamed during
//! composition, and finally compiled into a [`Node`] tree whose symbols are
//! resolved to vector slots so that evaluation never touches a string.
//!
//! Supported syntax: numbers, identifiers, `+ - * / ^`, comparisons
//! (`< <= > >= == !=`), `&& || !`, `cond ? a : b` and the functions `exp`,
//! `ln`/`log` (natural), `log10`, `sqrt`, `pow`, `min`, `max`, `abs`, `floor`,
//! `ceil`. The identifiers `t` and `time` denote model time.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Ident(String),
    Unary {
        op: UnaryOp,
        rhs: Box<Expr>,
    },
    Binary {
        lhs: Box<Expr>,
        op: BinaryOp,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
}

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
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Pow => "^",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Lt | Self::Gt | Self::Le | Self::Ge | Self::Eq | Self::Ne
        )
    }
}

/// Names that always refer to model time
pub fn is_time_symbol(name: &str) -> bool {
    name == "t" || name == "time"
}

impl Expr {
    /// Identifiers referenced by the expression, in first-use order
    pub fn identifiers(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers(&self, out: &mut Vec<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Ident(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Unary { rhs, .. } => rhs.collect_identifiers(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_identifiers(out);
                rhs.collect_identifiers(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_identifiers(out)),
            Expr::Ternary {
                cond,
                then_branch,
                else_branch,
            } => {
                cond.collect_identifiers(out);
                then_branch.collect_identifiers(out);
                else_branch.collect_identifiers(out);
            }
        }
    }

    /// Rename every non-time identifier in place
    pub fn rename(&mut self, rename: &impl Fn(&str) -> String) {
        match self {
            Expr::Number(_) => {}
            Expr::Ident(name) => {
                if !is_time_symbol(name) {
                    *name = rename(name);
                }
            }
            Expr::Unary { rhs, .. } => rhs.rename(rename),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.rename(rename);
                rhs.rename(rename);
            }
            Expr::Call { args, .. } => args.iter_mut().for_each(|a| a.rename(rename)),
            Expr::Ternary {
                cond,
                then_branch,
                else_branch,
            } => {
                cond.rename(rename);
                then_branch.rename(rename);
                else_branch.rename(rename);
            }
        }
    }

    /// Sum of expressions, left to right
    pub fn sum(terms: Vec<Expr>) -> Option<Expr> {
        terms.into_iter().reduce(|acc, term| Expr::Binary {
            lhs: Box::new(acc),
            op: BinaryOp::Add,
            rhs: Box::new(term),
        })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(v) if *v < 0.0 => write!(f, "({})", v),
            Expr::Number(v) => write!(f, "{}", v),
            Expr::Ident(name) => write!(f, "{}", name),
            Expr::Unary { op, rhs } => match op {
                UnaryOp::Neg => write!(f, "(-{})", rhs),
                UnaryOp::Not => write!(f, "(!{})", rhs),
            },
            Expr::Binary { lhs, op, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Ternary {
                cond,
                then_branch,
                else_branch,
            } => write!(f, "({} ? {} : {})", cond, then_branch, else_branch),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tokenizer + recursive-descent parser
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Num(f64),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Op(char),
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    And,
    Or,
    Bang,
    Question,
    Colon,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub pos: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at token {}: {}", self.pos, self.message)
    }
}

impl std::error::Error for ParseError {}

pub fn tokenize(s: &str) -> Result<Vec<Token>, ParseError> {
    let mut toks = Vec::new();
    let mut chars = s.chars().peekable();
    let err = |toks: &Vec<Token>, message: String| ParseError {
        pos: toks.len(),
        message,
    };
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            let mut num = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit()
                    || d == '.'
                    || d == 'e'
                    || d == 'E'
                    || ((d == '+' || d == '-') && (num.ends_with('e') || num.ends_with('E')))
                {
                    num.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let v = num
                .parse::<f64>()
                .map_err(|_| err(&toks, format!("invalid number '{}'", num)))?;
            toks.push(Token::Num(v));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let mut id = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_alphanumeric() || d == '_' {
                    id.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            toks.push(Token::Ident(id));
            continue;
        }
        chars.next();
        let tok = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '?' => Token::Question,
            ':' => Token::Colon,
            '+' | '-' | '*' | '/' | '^' => Token::Op(c),
            '<' | '>' | '=' | '!' => {
                let eq = chars.peek() == Some(&'=');
                if eq {
                    chars.next();
                }
                match (c, eq) {
                    ('<', true) => Token::Le,
                    ('<', false) => Token::Lt,
                    ('>', true) => Token::Ge,
                    ('>', false) => Token::Gt,
                    ('=', true) => Token::EqEq,
                    ('!', true) => Token::Ne,
                    ('!', false) => Token::Bang,
                    _ => return Err(err(&toks, "single '=' is not an operator".into())),
                }
            }
            '&' | '|' => {
                if chars.peek() != Some(&c) {
                    return Err(err(&toks, format!("expected '{}{}'", c, c)));
                }
                chars.next();
                if c == '&' {
                    Token::And
                } else {
                    Token::Or
                }
            }
            other => return Err(err(&toks, format!("unexpected character '{}'", other))),
        };
        toks.push(tok);
    }
    Ok(toks)
}

/// Parse an expression string into an [`Expr`]
pub fn parse_expression(s: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(s)?;
    if tokens.is_empty() {
        return Err(ParseError {
            pos: 0,
            message: "empty expression".into(),
        });
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    if let Some(tok) = parser.peek() {
        return Err(parser.error(format!("unexpected trailing token {:?}", tok)));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let r = self.tokens.get(self.pos).cloned();
        if r.is_some() {
            self.pos += 1;
        }
        r
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            pos: self.pos,
            message: message.into(),
        }
    }

    fn expect(&mut self, tok: Token) -> Result<(), ParseError> {
        match self.next() {
            Some(t) if t == tok => Ok(()),
            Some(t) => Err(self.error(format!("expected {:?}, found {:?}", tok, t))),
            None => Err(self.error(format!("expected {:?}, found end of input", tok))),
        }
    }

    fn binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Expr {
        Expr::Binary {
            lhs: Box::new(lhs),
            op,
            rhs: Box::new(rhs),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_or()?;
        if self.peek() == Some(&Token::Question) {
            self.next();
            let then_branch = self.parse_expr()?;
            self.expect(Token::Colon)?;
            let else_branch = self.parse_expr()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            });
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            node = Self::binary(node, BinaryOp::Or, rhs);
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_cmp()?;
            node = Self::binary(node, BinaryOp::And, rhs);
        }
        Ok(node)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_add_sub()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Ge) => BinaryOp::Ge,
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::Ne) => BinaryOp::Ne,
                _ => break,
            };
            self.next();
            let rhs = self.parse_add_sub()?;
            node = Self::binary(node, op, rhs);
        }
        Ok(node)
    }

    fn parse_add_sub(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_mul_div()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op('+')) => BinaryOp::Add,
                Some(Token::Op('-')) => BinaryOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.parse_mul_div()?;
            node = Self::binary(node, op, rhs);
        }
        Ok(node)
    }

    fn parse_mul_div(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op('*')) => BinaryOp::Mul,
                Some(Token::Op('/')) => BinaryOp::Div,
                _ => break,
            };
            self.next();
            let rhs = self.parse_unary()?;
            node = Self::binary(node, op, rhs);
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            Some(Token::Op('-')) => Some(UnaryOp::Neg),
            Some(Token::Bang) => Some(UnaryOp::Not),
            Some(Token::Op('+')) => {
                self.next();
                return self.parse_unary();
            }
            _ => None,
        };
        if let Some(op) = op {
            self.next();
            let rhs = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                rhs: Box::new(rhs),
            });
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_primary()?;
        if self.peek() == Some(&Token::Op('^')) {
            self.next();
            let exponent = self.parse_unary()?;
            return Ok(Self::binary(base, BinaryOp::Pow, exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Token::Num(v)) => Ok(Expr::Number(v)),
            Some(Token::Ident(id)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Ident(id));
                }
                self.next();
                let mut args = Vec::new();
                if self.peek() == Some(&Token::RParen) {
                    self.next();
                    return Ok(Expr::Call { name: id, args });
                }
                loop {
                    args.push(self.parse_expr()?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RParen) => break,
                        other => {
                            return Err(self.error(format!(
                                "expected ',' or ')' in call to '{}', found {:?}",
                                id, other
                            )))
                        }
                    }
                }
                Ok(Expr::Call { name: id, args })
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(other) => Err(self.error(format!("unexpected token {:?}", other))),
            None => Err(self.error("unexpected end of input")),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Compiled form
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage location of a resolved symbol
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Slot {
    /// State vector entry used as an amount
    Amount(usize),
    /// State vector entry divided by its compartment size
    Concentration { state: usize, compartment: usize },
    Param(usize),
    Compartment(usize),
    Assigned(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Func {
    Exp,
    Ln,
    Log10,
    Sqrt,
    Pow,
    Min,
    Max,
    Abs,
    Floor,
    Ceil,
}

impl Func {
    pub(crate) fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "exp" => Self::Exp,
            "ln" | "log" => Self::Ln,
            "log10" => Self::Log10,
            "sqrt" => Self::Sqrt,
            "pow" | "powf" => Self::Pow,
            "min" => Self::Min,
            "max" => Self::Max,
            "abs" => Self::Abs,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            _ => return None,
        })
    }

    fn arity_ok(&self, n: usize) -> bool {
        match self {
            Self::Pow => n == 2,
            Self::Min | Self::Max => n >= 1,
            _ => n == 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Const(f64),
    Time,
    Symbol(Slot),
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
}

/// Values visible to an expression at one evaluation point
pub(crate) struct Frame<'a> {
    pub t: f64,
    pub x: &'a [f64],
    pub p: &'a [f64],
    pub volumes: &'a [f64],
    pub assigned: &'a [f64],
}

fn truth(v: bool) -> f64 {
    if v {
        1.0
    } else {
        0.0
    }
}

impl Node {
    /// Compile an expression, resolving identifiers through `resolve`
    pub(crate) fn compile(
        expr: &Expr,
        resolve: &impl Fn(&str) -> Option<Slot>,
    ) -> Result<Node, String> {
        Ok(match expr {
            Expr::Number(v) => Node::Const(*v),
            Expr::Ident(name) => match resolve(name) {
                Some(slot) => Node::Symbol(slot),
                None if is_time_symbol(name) => Node::Time,
                None => return Err(format!("undefined symbol '{}'", name)),
            },
            Expr::Unary { op, rhs } => Node::Unary(*op, Box::new(Self::compile(rhs, resolve)?)),
            Expr::Binary { lhs, op, rhs } => Node::Binary(
                *op,
                Box::new(Self::compile(lhs, resolve)?),
                Box::new(Self::compile(rhs, resolve)?),
            ),
            Expr::Call { name, args } => {
                let func =
                    Func::lookup(name).ok_or_else(|| format!("unknown function '{}'", name))?;
                if !func.arity_ok(args.len()) {
                    return Err(format!(
                        "function '{}' called with {} arguments",
                        name,
                        args.len()
                    ));
                }
                let args = args
                    .iter()
                    .map(|a| Self::compile(a, resolve))
                    .collect::<Result<Vec<_>, _>>()?;
                Node::Call(func, args)
            }
            Expr::Ternary {
                cond,
                then_branch,
                else_branch,
            } => Node::Ternary(
                Box::new(Self::compile(cond, resolve)?),
                Box::new(Self::compile(then_branch, resolve)?),
                Box::new(Self::compile(else_branch, resolve)?),
            ),
        })
    }

    pub(crate) fn eval(&self, frame: &Frame) -> f64 {
        match self {
            Node::Const(v) => *v,
            Node::Time => frame.t,
            Node::Symbol(slot) => match *slot {
                Slot::Amount(i) => frame.x[i],
                Slot::Concentration { state, compartment } => {
                    frame.x[state] / frame.volumes[compartment]
                }
                Slot::Param(i) => frame.p[i],
                Slot::Compartment(i) => frame.volumes[i],
                Slot::Assigned(i) => frame.assigned[i],
            },
            Node::Unary(op, rhs) => {
                let v = rhs.eval(frame);
                match op {
                    UnaryOp::Neg => -v,
                    UnaryOp::Not => truth(v == 0.0),
                }
            }
            Node::Binary(op, lhs, rhs) => {
                let a = lhs.eval(frame);
                // short-circuit logic keeps guarded branches from producing NaN noise
                match op {
                    BinaryOp::And if a == 0.0 => return 0.0,
                    BinaryOp::Or if a != 0.0 => return 1.0,
                    _ => {}
                }
                let b = rhs.eval(frame);
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                    BinaryOp::Lt => truth(a < b),
                    BinaryOp::Gt => truth(a > b),
                    BinaryOp::Le => truth(a <= b),
                    BinaryOp::Ge => truth(a >= b),
                    BinaryOp::Eq => truth(a == b),
                    BinaryOp::Ne => truth(a != b),
                    BinaryOp::And | BinaryOp::Or => truth(b != 0.0),
                }
            }
            Node::Call(func, args) => {
                let arg = |i: usize| args[i].eval(frame);
                match func {
                    Func::Exp => arg(0).exp(),
                    Func::Ln => arg(0).ln(),
                    Func::Log10 => arg(0).log10(),
                    Func::Sqrt => arg(0).sqrt(),
                    Func::Pow => arg(0).powf(arg(1)),
                    Func::Min => args
                        .iter()
                        .map(|a| a.eval(frame))
                        .fold(f64::INFINITY, f64::min),
                    Func::Max => args
                        .iter()
                        .map(|a| a.eval(frame))
                        .fold(f64::NEG_INFINITY, f64::max),
                    Func::Abs => arg(0).abs(),
                    Func::Floor => arg(0).floor(),
                    Func::Ceil => arg(0).ceil(),
                }
            }
            Node::Ternary(cond, then_branch, else_branch) => {
                if cond.eval(frame) != 0.0 {
                    then_branch.eval(frame)
                } else {
                    else_branch.eval(frame)
                }
            }
        }
    }
}
