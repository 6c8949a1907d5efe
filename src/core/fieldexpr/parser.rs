//! Recursive-descent parser producing the expression AST.
//!
//! Precedence, lowest first: comparison/logical (one shared tier, left
//! associative), additive, multiplicative, unary minus, call/atom. Keeping
//! every comparison and logical operator on the same tier reproduces the
//! strict left-to-right folding the language has always had.

use super::EvalError;
use super::lexer::Token;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Str(String),
    Var(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    Or,
    And,
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), EvalError> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(EvalError::Parse(format!(
                "expected {} but found {:?}",
                what, tok
            ))),
            None => Err(EvalError::Parse(format!(
                "expected {} but input ended",
                what
            ))),
        }
    }

    fn comp(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.sum()?;
        loop {
            let op = match self.peek() {
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                Some(Token::OrOr) => BinOp::Or,
                Some(Token::AndAnd) => BinOp::And,
                _ => break,
            };
            self.pos += 1;
            let right = self.sum()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn sum(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.product()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn product(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.factor()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, EvalError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            let inner = self.factor()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.molecule()
    }

    fn molecule(&mut self) -> Result<Expr, EvalError> {
        if let Some(Token::Ident(name)) = self.peek() {
            let name = name.clone();
            self.pos += 1;
            self.expect(&Token::LParen, "'(' after function name")?;
            let mut args = Vec::new();
            if self.peek() != Some(&Token::RParen) {
                loop {
                    args.push(self.comp()?);
                    match self.peek() {
                        Some(Token::Comma) => {
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
            }
            self.expect(&Token::RParen, "')' to close argument list")?;
            return Ok(Expr::Call(name, args));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, EvalError> {
        match self.next().cloned() {
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Var(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.comp()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(tok) => Err(EvalError::Parse(format!(
                "unexpected token {:?}",
                tok
            ))),
            None => Err(EvalError::Parse("unexpected end of expression".into())),
        }
    }
}

pub fn parse(tokens: &[Token]) -> Result<Expr, EvalError> {
    if tokens.is_empty() {
        return Err(EvalError::Parse("empty expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.comp()?;
    if parser.pos != tokens.len() {
        return Err(EvalError::Parse(format!(
            "trailing input after expression: {:?}",
            tokens[parser.pos]
        )));
    }
    Ok(expr)
}
