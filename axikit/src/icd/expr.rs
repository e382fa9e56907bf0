//! Scaling expressions embedded in ICD field elements.
//!
//! The document may attach a formula to a field, evaluated with the field's
//! current value bound to `x` before packing. The grammar is deliberately
//! tiny: `+ - * / % << >> & | ^ ( ) x` and numeric literals (decimal, hex,
//! binary, floats). Anything else is rejected when the document loads.
//! Division always produces a float; the bit operators demand integers.

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    /// Truncate toward zero, the way the packer coerces floats into integer
    /// fields.
    pub fn trunc_i64(self) -> i64 {
        match self {
            Num::Int(i) => i,
            Num::Float(f) => f as i64,
        }
    }

    fn int(self, op: char) -> Result<i64> {
        match self {
            Num::Int(i) => Ok(i),
            Num::Float(f) => Err(Error::Schema(format!(
                "operator '{}' needs integer operands, got {}",
                op, f
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    And,
    Or,
    Xor,
}

#[derive(Clone, Debug)]
enum Ast {
    Num(Num),
    X,
    Neg(Box<Ast>),
    Bin(Op, Box<Ast>, Box<Ast>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Token {
    Num(Num),
    X,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Shl,
    Shr,
    And,
    Or,
    Xor,
    LParen,
    RParen,
}

fn lex(src: &str) -> Result<Vec<Token>> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                out.push(Token::Plus);
                i += 1;
            }
            '-' => {
                out.push(Token::Minus);
                i += 1;
            }
            '*' => {
                out.push(Token::Star);
                i += 1;
            }
            '/' => {
                out.push(Token::Slash);
                i += 1;
            }
            '%' => {
                out.push(Token::Percent);
                i += 1;
            }
            '&' => {
                out.push(Token::And);
                i += 1;
            }
            '|' => {
                out.push(Token::Or);
                i += 1;
            }
            '^' => {
                out.push(Token::Xor);
                i += 1;
            }
            '(' => {
                out.push(Token::LParen);
                i += 1;
            }
            ')' => {
                out.push(Token::RParen);
                i += 1;
            }
            '<' | '>' => {
                if i + 1 < bytes.len() && bytes[i + 1] as char == c {
                    out.push(if c == '<' { Token::Shl } else { Token::Shr });
                    i += 2;
                } else {
                    return Err(Error::Schema(format!("lone '{}' in expression '{}'", c, src)));
                }
            }
            'x' => {
                out.push(Token::X);
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                if c == '0' && i + 1 < bytes.len() && matches!(bytes[i + 1] as char, 'x' | 'X' | 'b' | 'B')
                {
                    let radix = if matches!(bytes[i + 1] as char, 'x' | 'X') { 16 } else { 2 };
                    i += 2;
                    let digits = i;
                    while i < bytes.len() && (bytes[i] as char).is_ascii_alphanumeric() {
                        i += 1;
                    }
                    let value = i64::from_str_radix(&src[digits..i], radix).map_err(|_| {
                        Error::Schema(format!("bad literal '{}' in expression '{}'", &src[start..i], src))
                    })?;
                    out.push(Token::Num(Num::Int(value)));
                } else {
                    let mut is_float = false;
                    while i < bytes.len() && matches!(bytes[i] as char, '0'..='9' | '.') {
                        if bytes[i] as char == '.' {
                            is_float = true;
                        }
                        i += 1;
                    }
                    let text = &src[start..i];
                    let num = if is_float {
                        Num::Float(text.parse().map_err(|_| {
                            Error::Schema(format!("bad literal '{}' in expression '{}'", text, src))
                        })?)
                    } else {
                        Num::Int(text.parse().map_err(|_| {
                            Error::Schema(format!("bad literal '{}' in expression '{}'", text, src))
                        })?)
                    };
                    out.push(Token::Num(num));
                }
            }
            _ => {
                return Err(Error::Schema(format!(
                    "character '{}' is outside the expression grammar: '{}'",
                    c, src
                )))
            }
        }
    }
    Ok(out)
}

struct Parser<'a> {
    toks: &'a [Token],
    pos: usize,
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Token> {
        self.toks.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.peek();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, want: Token) -> Result<()> {
        match self.bump() {
            Some(t) if t == want => Ok(()),
            _ => Err(Error::Schema(format!("unbalanced expression '{}'", self.src))),
        }
    }

    // precedence, loosest first: | ^ & (<< >>) (+ -) (* / %) unary-
    fn expr(&mut self) -> Result<Ast> {
        self.binary(0)
    }

    fn binary(&mut self, level: usize) -> Result<Ast> {
        const LEVELS: [&[(Token, Op)]; 6] = [
            &[(Token::Or, Op::Or)],
            &[(Token::Xor, Op::Xor)],
            &[(Token::And, Op::And)],
            &[(Token::Shl, Op::Shl), (Token::Shr, Op::Shr)],
            &[(Token::Plus, Op::Add), (Token::Minus, Op::Sub)],
            &[(Token::Star, Op::Mul), (Token::Slash, Op::Div), (Token::Percent, Op::Rem)],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }
        let mut lhs = self.binary(level + 1)?;
        while let Some(tok) = self.peek() {
            match LEVELS[level].iter().find(|(t, _)| *t == tok) {
                Some((_, op)) => {
                    self.bump();
                    let rhs = self.binary(level + 1)?;
                    lhs = Ast::Bin(*op, Box::new(lhs), Box::new(rhs));
                }
                None => break,
            }
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Ast> {
        if self.peek() == Some(Token::Minus) {
            self.bump();
            return Ok(Ast::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Ast> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Ast::Num(n)),
            Some(Token::X) => Ok(Ast::X),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.eat(Token::RParen)?;
                Ok(inner)
            }
            _ => Err(Error::Schema(format!("dangling expression '{}'", self.src))),
        }
    }
}

fn parse(src: &str) -> Result<Ast> {
    let toks = lex(src)?;
    let mut parser = Parser {
        toks: &toks,
        pos: 0,
        src,
    };
    let ast = parser.expr()?;
    if parser.pos != toks.len() {
        return Err(Error::Schema(format!("trailing tokens in expression '{}'", src)));
    }
    Ok(ast)
}

fn apply(op: Op, lhs: Num, rhs: Num) -> Result<Num> {
    use Num::{Float, Int};
    Ok(match (op, lhs, rhs) {
        (Op::Add, Int(a), Int(b)) => Int(a.wrapping_add(b)),
        (Op::Add, a, b) => Float(a.as_f64() + b.as_f64()),
        (Op::Sub, Int(a), Int(b)) => Int(a.wrapping_sub(b)),
        (Op::Sub, a, b) => Float(a.as_f64() - b.as_f64()),
        (Op::Mul, Int(a), Int(b)) => Int(a.wrapping_mul(b)),
        (Op::Mul, a, b) => Float(a.as_f64() * b.as_f64()),
        (Op::Div, a, b) => {
            if b.as_f64() == 0.0 {
                return Err(Error::Schema("division by zero in expression".to_string()));
            }
            Float(a.as_f64() / b.as_f64())
        }
        (Op::Rem, Int(a), Int(b)) => {
            if b == 0 {
                return Err(Error::Schema("modulo by zero in expression".to_string()));
            }
            Int(a.wrapping_rem(b))
        }
        (Op::Rem, a, b) => {
            if b.as_f64() == 0.0 {
                return Err(Error::Schema("modulo by zero in expression".to_string()));
            }
            Float(a.as_f64() % b.as_f64())
        }
        (Op::Shl, a, b) => Int(a.int('<')?.wrapping_shl(b.int('<')? as u32)),
        (Op::Shr, a, b) => Int(a.int('>')?.wrapping_shr(b.int('>')? as u32)),
        (Op::And, a, b) => Int(a.int('&')? & b.int('&')?),
        (Op::Or, a, b) => Int(a.int('|')? | b.int('|')?),
        (Op::Xor, a, b) => Int(a.int('^')? ^ b.int('^')?),
    })
}

fn eval_ast(ast: &Ast, x: Num) -> Result<Num> {
    match ast {
        Ast::Num(n) => Ok(*n),
        Ast::X => Ok(x),
        Ast::Neg(inner) => match eval_ast(inner, x)? {
            Num::Int(i) => Ok(Num::Int(-i)),
            Num::Float(f) => Ok(Num::Float(-f)),
        },
        Ast::Bin(op, lhs, rhs) => {
            let lhs = eval_ast(lhs, x)?;
            let rhs = eval_ast(rhs, x)?;
            apply(*op, lhs, rhs)
        }
    }
}

/// Syntax check at document load.
pub(crate) fn validate(src: &str) -> Result<()> {
    parse(src).map(|_| ())
}

/// Evaluate with the field value bound to `x`.
pub(crate) fn eval(src: &str, x: Num) -> Result<Num> {
    eval_ast(&parse(src)?, x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_with_x() {
        assert_eq!(eval("x*2+1", Num::Int(10)).unwrap(), Num::Int(21));
        assert_eq!(eval("(x+1)*3", Num::Int(2)).unwrap(), Num::Int(9));
        assert_eq!(eval("-x", Num::Int(5)).unwrap(), Num::Int(-5));
    }

    #[test]
    fn division_promotes_to_float() {
        assert_eq!(eval("x/4", Num::Int(10)).unwrap(), Num::Float(2.5));
        assert_eq!(eval("10/4*4", Num::Int(0)).unwrap(), Num::Float(10.0));
    }

    #[test]
    fn bit_operators_need_integers() {
        assert_eq!(eval("x<<3|1", Num::Int(1)).unwrap(), Num::Int(9));
        assert_eq!(eval("x&0xFF", Num::Int(0x1FF)).unwrap(), Num::Int(0xFF));
        assert_eq!(eval("x^0b1010", Num::Int(0)).unwrap(), Num::Int(10));
        assert!(eval("x<<1", Num::Float(1.5)).is_err());
    }

    #[test]
    fn precedence_matches_c() {
        // shift binds tighter than and, which binds tighter than xor and or
        assert_eq!(eval("1<<4&0xFF", Num::Int(0)).unwrap(), Num::Int(16));
        assert_eq!(eval("2*3+4", Num::Int(0)).unwrap(), Num::Int(10));
        assert_eq!(eval("2+3*4", Num::Int(0)).unwrap(), Num::Int(14));
    }

    #[test]
    fn foreign_syntax_is_rejected() {
        assert!(validate("x + 1").is_ok());
        assert!(validate("__import__('os')").is_err());
        assert!(validate("x.y").is_err());
        assert!(validate("x(1)").is_err());
        assert!(validate("x++").is_err());
        assert!(validate("(x").is_err());
        assert!(validate("y+1").is_err());
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(eval("1/x", Num::Int(0)).is_err());
        assert!(eval("1%x", Num::Int(0)).is_err());
    }
}
