//! Expression compilation for axis, selection and weight expressions.
//!
//! The engine talks to compiled expressions through the [`Expression`] and
//! [`Compiler`] traits, so any front end can be plugged in. [`ExprCompiler`]
//! is the built-in one: arithmetic (+, -, *, /), comparisons
//! (==, !=, <, <=, >, >=), boolean operators (&&, ||, !), and built-in
//! functions (abs, sqrt, log, exp, pow, min, max). Boolean results are 1.0/0.0.

use std::fmt;

use crate::error::{HistError, Result};
use crate::schema::Schema;

/// A compiled, row-wise evaluable expression.
pub trait Expression: fmt::Debug + Send + Sync {
    /// Field names referenced by the expression, in the order `eval_row` expects them.
    fn fields(&self) -> &[String];

    /// Evaluate for one slot. `values[i]` is the value of `fields()[i]`.
    fn eval_row(&self, values: &[f64]) -> f64;
}

/// Turns expression text into an [`Expression`] resolved against a schema.
pub trait Compiler: fmt::Debug + Send + Sync {
    /// Compile `text`; unknown fields or malformed text yield [`HistError::CompileError`].
    fn compile(&self, text: &str, schema: &Schema) -> Result<Box<dyn Expression>>;
}

/// The built-in expression compiler.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprCompiler;

impl Compiler for ExprCompiler {
    fn compile(&self, text: &str, schema: &Schema) -> Result<Box<dyn Expression>> {
        let expr = CompiledExpr::compile(text)?;
        if let Some(unknown) = expr.fields.iter().find(|f| schema.kind(f).is_none()) {
            return Err(HistError::compile(text, format!("unknown field '{unknown}'")));
        }
        Ok(Box::new(expr))
    }
}

// ── AST ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Expr {
    Number(f64),
    Var(usize), // index into fields
    UnaryNeg(Box<Expr>),
    UnaryNot(Box<Expr>),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy)]
enum Func {
    Abs,
    Sqrt,
    Log,
    Exp,
    Pow,
    Min,
    Max,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Func::Abs,
            "sqrt" => Func::Sqrt,
            "log" => Func::Log,
            "exp" => Func::Exp,
            "pow" => Func::Pow,
            "min" => Func::Min,
            "max" => Func::Max,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Func::Abs | Func::Sqrt | Func::Log | Func::Exp => 1,
            Func::Pow | Func::Min | Func::Max => 2,
        }
    }
}

// ── Compiled expression ────────────────────────────────────────

/// An expression parsed by [`ExprCompiler`].
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    ast: Expr,
    /// Field names referenced by this expression (ordered by first occurrence).
    pub fields: Vec<String>,
}

impl CompiledExpr {
    /// Parse an expression string without resolving it against a schema.
    pub fn compile(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser::new(input, &tokens);
        let ast = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(HistError::compile(
                input,
                format!("unexpected token after expression: {:?}", parser.tokens[parser.pos]),
            ));
        }
        let fields = std::mem::take(&mut parser.fields);
        Ok(CompiledExpr { ast, fields })
    }
}

impl Expression for CompiledExpr {
    fn fields(&self) -> &[String] {
        &self.fields
    }

    fn eval_row(&self, values: &[f64]) -> f64 {
        eval_expr(&self.ast, values)
    }
}

// ── Evaluation ─────────────────────────────────────────────────

#[inline]
fn truth(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn eval_expr(e: &Expr, vals: &[f64]) -> f64 {
    match e {
        Expr::Number(n) => *n,
        Expr::Var(i) => vals[*i],
        Expr::UnaryNeg(a) => -eval_expr(a, vals),
        Expr::UnaryNot(a) => truth(eval_expr(a, vals) == 0.0),
        Expr::BinOp(op, a, b) => {
            let lhs = eval_expr(a, vals);
            let rhs = eval_expr(b, vals);
            match op {
                BinOp::Add => lhs + rhs,
                BinOp::Sub => lhs - rhs,
                BinOp::Mul => lhs * rhs,
                BinOp::Div => lhs / rhs,
                BinOp::Eq => truth((lhs - rhs).abs() < f64::EPSILON),
                BinOp::Ne => truth((lhs - rhs).abs() >= f64::EPSILON),
                BinOp::Lt => truth(lhs < rhs),
                BinOp::Le => truth(lhs <= rhs),
                BinOp::Gt => truth(lhs > rhs),
                BinOp::Ge => truth(lhs >= rhs),
                BinOp::And => truth(lhs != 0.0 && rhs != 0.0),
                BinOp::Or => truth(lhs != 0.0 || rhs != 0.0),
            }
        }
        Expr::Call(f, args) => {
            let a0 = || eval_expr(&args[0], vals);
            let a1 = || eval_expr(&args[1], vals);
            match f {
                Func::Abs => a0().abs(),
                Func::Sqrt => a0().sqrt(),
                Func::Log => a0().ln(),
                Func::Exp => a0().exp(),
                Func::Pow => a0().powf(a1()),
                Func::Min => a0().min(a1()),
                Func::Max => a0().max(a1()),
            }
        }
    }
}

// ── Tokenizer ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Two-character operators
        if let Some(&next) = chars.get(i + 1) {
            let tok = match (c, next) {
                ('&', '&') => Some(Token::And),
                ('|', '|') => Some(Token::Or),
                ('=', '=') => Some(Token::Eq),
                ('!', '=') => Some(Token::Ne),
                ('<', '=') => Some(Token::Le),
                ('>', '=') => Some(Token::Ge),
                _ => None,
            };
            if let Some(t) = tok {
                tokens.push(t);
                i += 2;
                continue;
            }
        }

        let single = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            '<' => Some(Token::Lt),
            '>' => Some(Token::Gt),
            '!' => Some(Token::Not),
            _ => None,
        };
        if let Some(t) = single {
            tokens.push(t);
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_digit()
                    || chars[i] == '.'
                    || chars[i] == 'e'
                    || chars[i] == 'E'
                    || ((chars[i] == '+' || chars[i] == '-')
                        && i > start
                        && (chars[i - 1] == 'e' || chars[i - 1] == 'E')))
            {
                i += 1;
            }
            let s: String = chars[start..i].iter().collect();
            let n: f64 =
                s.parse().map_err(|_| HistError::compile(input, format!("invalid number: '{s}'")))?;
            tokens.push(Token::Num(n));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            return Err(HistError::compile(input, format!("unexpected character: '{c}'")));
        }
    }

    Ok(tokens)
}

// ── Parser (recursive descent) ─────────────────────────────────

struct Parser<'a> {
    input: &'a str,
    tokens: &'a [Token],
    pos: usize,
    fields: Vec<String>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str, tokens: &'a [Token]) -> Self {
        Self { input, tokens, pos: 0, fields: Vec::new() }
    }

    fn err(&self, msg: String) -> HistError {
        HistError::compile(self.input, msg)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.advance().cloned() {
            Some(t) if &t == expected => Ok(()),
            other => Err(self.err(format!("expected {expected:?}, got {other:?}"))),
        }
    }

    fn resolve_var(&mut self, name: &str) -> usize {
        if let Some(i) = self.fields.iter().position(|b| b == name) {
            i
        } else {
            self.fields.push(name.to_string());
            self.fields.len() - 1
        }
    }

    // ── Grammar rules ──────────────────────────────────────────

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::BinOp(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_cmp()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_cmp()?;
            lhs = Expr::BinOp(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_add()?;
        Ok(Expr::BinOp(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_mul()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::UnaryNeg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::UnaryNot(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.advance().cloned() {
            Some(Token::Num(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let e = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            Some(Token::Ident(name)) => {
                if !matches!(self.peek(), Some(Token::LParen)) {
                    return Ok(Expr::Var(self.resolve_var(&name)));
                }
                self.advance(); // consume '('
                let func =
                    Func::lookup(&name).ok_or_else(|| self.err(format!("unknown function: '{name}'")))?;
                let mut args = vec![self.parse_or()?];
                while matches!(self.peek(), Some(Token::Comma)) {
                    self.advance();
                    args.push(self.parse_or()?);
                }
                self.expect(&Token::RParen)?;
                if args.len() != func.arity() {
                    return Err(self.err(format!(
                        "function '{name}' takes {} argument(s), got {}",
                        func.arity(),
                        args.len()
                    )));
                }
                Ok(Expr::Call(func, args))
            }
            other => Err(self.err(format!("expected number, identifier, or '(', got {other:?}"))),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(text: &str, vals: &[f64]) -> f64 {
        CompiledExpr::compile(text).unwrap().eval_row(vals)
    }

    #[test]
    fn simple_arithmetic() {
        let e = CompiledExpr::compile("2 + 3 * 4").unwrap();
        assert!(e.fields.is_empty());
        assert!((e.eval_row(&[]) - 14.0).abs() < 1e-10);
    }

    #[test]
    fn variables_in_first_occurrence_order() {
        let e = CompiledExpr::compile("TauJets.pt * weight_mc / TauJets.pt").unwrap();
        assert_eq!(e.fields, vec!["TauJets.pt", "weight_mc"]);
        assert!((e.eval_row(&[100.0, 0.5]) - 0.5).abs() < 1e-10);
    }

    #[test]
    fn comparison_and_boolean() {
        let text = "njet >= 4 && pt_lead > 25.0";
        assert_eq!(eval(text, &[4.0, 30.0]), 1.0);
        assert_eq!(eval(text, &[3.0, 30.0]), 0.0);
        assert_eq!(eval(text, &[4.0, 20.0]), 0.0);
        assert_eq!(eval("x > 5 || y < 2", &[3.0, 1.0]), 1.0);
        assert_eq!(eval("!(x > 3)", &[2.0]), 1.0);
    }

    #[test]
    fn functions() {
        assert!((eval("sqrt(x)", &[9.0]) - 3.0).abs() < 1e-10);
        assert!((eval("pow(x, 2)", &[3.0]) - 9.0).abs() < 1e-10);
        assert!((eval("max(a, b)", &[3.0, 7.0]) - 7.0).abs() < 1e-10);
        assert!((eval("-x + 1", &[5.0]) + 4.0).abs() < 1e-10);
        assert!((eval("1.5e2 + 3.0E-1", &[]) - 150.3).abs() < 1e-10);
    }

    #[test]
    fn syntax_errors() {
        assert!(matches!(CompiledExpr::compile("x +"), Err(HistError::CompileError { .. })));
        assert!(CompiledExpr::compile("(x").is_err());
        assert!(CompiledExpr::compile("x $ y").is_err());
        assert!(CompiledExpr::compile("foo(x)").is_err());
        assert!(CompiledExpr::compile("min(x)").is_err());
        assert!(CompiledExpr::compile("x y").is_err());
    }

    #[test]
    fn compiler_resolves_against_schema() {
        let schema = Schema::new().scalar("mu").jagged("pt");
        let e = ExprCompiler.compile("pt * mu", &schema).unwrap();
        assert_eq!(e.fields(), ["pt".to_string(), "mu".to_string()]);

        let err = ExprCompiler.compile("eta", &schema).unwrap_err();
        assert!(err.to_string().contains("unknown field 'eta'"));
    }
}
