//! Parser: token stream to statements

use super::ScriptError;
use super::lexer::{Spanned, Tok, tokenize};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// `first op1 e1 op2 e2 ...`, chained like `a < b < c`
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    /// `then if cond else otherwise`
    Cond {
        then: Box<Expr>,
        cond: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Index(Box<Expr>, Box<Expr>),
    Attr(Box<Expr>, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign {
        name: String,
        value: Expr,
        line: usize,
    },
    AssignIndex {
        name: String,
        index: Expr,
        value: Expr,
        line: usize,
    },
    Expr {
        expr: Expr,
        line: usize,
    },
}

impl Stmt {
    pub fn line(&self) -> usize {
        match self {
            Stmt::Assign { line, .. } | Stmt::AssignIndex { line, .. } | Stmt::Expr { line, .. } => {
                *line
            }
        }
    }
}

struct Parser {
    toks: Vec<Spanned>,
    i: usize,
}

/// Parse a whole program
pub fn parse_program(src: &str) -> Result<Vec<Stmt>, ScriptError> {
    let mut p = Parser {
        toks: tokenize(src)?,
        i: 0,
    };
    let mut stmts = Vec::new();
    loop {
        while p.eat(&Tok::Newline) {}
        if p.peek() == &Tok::Eof {
            return Ok(stmts);
        }
        stmts.push(p.statement()?);
    }
}

/// Parse a single expression, e.g. the text after a `PY@` marker
#[cfg(test)]
pub(crate) fn parse_expression(src: &str) -> Result<Expr, ScriptError> {
    let mut p = Parser {
        toks: tokenize(src)?,
        i: 0,
    };
    let expr = p.expr()?;
    while p.eat(&Tok::Newline) {}
    if p.peek() != &Tok::Eof {
        return Err(p.err("unexpected trailing input after expression"));
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.toks.get(self.i).map(|s| &s.tok).unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.toks
            .get(self.i)
            .or_else(|| self.toks.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn bump(&mut self) -> Tok {
        let t = self.peek().clone();
        self.i += 1;
        t
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Tok::Sym(s) if *s == sym) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Tok::Kw(k) if *k == kw) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), ScriptError> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.err(format!("expected '{sym}', found {}", describe(self.peek()))))
        }
    }

    fn err(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        let target = self.expr()?;
        let stmt = if self.eat_sym("=") {
            let value = self.expr()?;
            match target {
                Expr::Name(name) => Stmt::Assign { name, value, line },
                Expr::Index(base, index) => match *base {
                    Expr::Name(name) => Stmt::AssignIndex {
                        name,
                        index: *index,
                        value,
                        line,
                    },
                    _ => return Err(self.err("can only assign to name[key]")),
                },
                _ => return Err(self.err("cannot assign to this expression")),
            }
        } else {
            Stmt::Expr { expr: target, line }
        };
        if !self.eat(&Tok::Newline) {
            return Err(self.err(format!(
                "expected end of statement, found {}",
                describe(self.peek())
            )));
        }
        Ok(stmt)
    }

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        let then = self.or()?;
        if self.eat_kw("if") {
            let cond = self.or()?;
            if !self.eat_kw("else") {
                return Err(self.err("expected 'else' in conditional expression"));
            }
            let otherwise = self.expr()?;
            return Ok(Expr::Cond {
                then: Box::new(then),
                cond: Box::new(cond),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(then)
    }

    fn or(&mut self) -> Result<Expr, ScriptError> {
        let mut e = self.and()?;
        while self.eat_kw("or") {
            let r = self.and()?;
            e = Expr::Or(Box::new(e), Box::new(r));
        }
        Ok(e)
    }

    fn and(&mut self) -> Result<Expr, ScriptError> {
        let mut e = self.not()?;
        while self.eat_kw("and") {
            let r = self.not()?;
            e = Expr::And(Box::new(e), Box::new(r));
        }
        Ok(e)
    }

    fn not(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_kw("not") {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let first = self.additive()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Sym("==") => CmpOp::Eq,
                Tok::Sym("!=") => CmpOp::Ne,
                Tok::Sym("<") => CmpOp::Lt,
                Tok::Sym("<=") => CmpOp::Le,
                Tok::Sym(">") => CmpOp::Gt,
                Tok::Sym(">=") => CmpOp::Ge,
                Tok::Kw("in") => CmpOp::In,
                Tok::Kw("not")
                    if matches!(self.toks.get(self.i + 1).map(|s| &s.tok), Some(Tok::Kw("in"))) =>
                {
                    self.i += 1;
                    CmpOp::NotIn
                }
                _ => break,
            };
            self.i += 1;
            rest.push((op, self.additive()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn additive(&mut self) -> Result<Expr, ScriptError> {
        let mut e = self.multiplicative()?;
        loop {
            let op = if self.eat_sym("+") {
                BinOp::Add
            } else if self.eat_sym("-") {
                BinOp::Sub
            } else {
                break;
            };
            let r = self.multiplicative()?;
            e = Expr::Bin(op, Box::new(e), Box::new(r));
        }
        Ok(e)
    }

    fn multiplicative(&mut self) -> Result<Expr, ScriptError> {
        let mut e = self.unary()?;
        loop {
            let op = if self.eat_sym("*") {
                BinOp::Mul
            } else if self.eat_sym("//") {
                BinOp::FloorDiv
            } else if self.eat_sym("/") {
                BinOp::Div
            } else if self.eat_sym("%") {
                BinOp::Mod
            } else {
                break;
            };
            let r = self.unary()?;
            e = Expr::Bin(op, Box::new(e), Box::new(r));
        }
        Ok(e)
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_sym("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat_sym("+") {
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ScriptError> {
        let base = self.postfix()?;
        if self.eat_sym("**") {
            // right-associative, binds tighter than unary minus on the left
            let exp = self.unary()?;
            return Ok(Expr::Bin(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut e = self.primary()?;
        loop {
            if self.eat_sym("(") {
                let (args, kwargs) = self.call_args()?;
                e = Expr::Call {
                    func: Box::new(e),
                    args,
                    kwargs,
                };
            } else if self.eat_sym("[") {
                let index = self.expr()?;
                self.expect_sym("]")?;
                e = Expr::Index(Box::new(e), Box::new(index));
            } else if self.eat_sym(".") {
                match self.bump() {
                    Tok::Ident(name) => e = Expr::Attr(Box::new(e), name),
                    other => {
                        return Err(self.err(format!(
                            "expected attribute name after '.', found {}",
                            describe(&other)
                        )));
                    }
                }
            } else {
                return Ok(e);
            }
        }
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ScriptError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !self.eat_sym(")") {
            let is_kwarg = matches!(self.peek(), Tok::Ident(_))
                && matches!(self.toks.get(self.i + 1).map(|s| &s.tok), Some(Tok::Sym("=")));
            if is_kwarg {
                let Tok::Ident(name) = self.bump() else {
                    return Err(self.err("expected keyword argument name"));
                };
                self.i += 1;
                kwargs.push((name, self.expr()?));
            } else if kwargs.is_empty() {
                args.push(self.expr()?);
            } else {
                return Err(self.err("positional argument follows keyword argument"));
            }
            if !self.eat_sym(",") {
                self.expect_sym(")")?;
                break;
            }
        }
        Ok((args, kwargs))
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        match self.bump() {
            Tok::Int(n) => Ok(Expr::Int(n)),
            Tok::Float(f) => Ok(Expr::Float(f)),
            Tok::Str(s) => {
                // adjacent literals concatenate
                let mut s = s;
                while let Tok::Str(next) = self.peek() {
                    s.push_str(next);
                    self.i += 1;
                }
                Ok(Expr::Str(s))
            }
            Tok::Ident(name) => Ok(Expr::Name(name)),
            Tok::Kw("True") => Ok(Expr::Bool(true)),
            Tok::Kw("False") => Ok(Expr::Bool(false)),
            Tok::Kw("None") => Ok(Expr::None),
            Tok::Sym("(") => {
                let e = self.expr()?;
                self.expect_sym(")")?;
                Ok(e)
            }
            Tok::Sym("[") => {
                let mut items = Vec::new();
                while !self.eat_sym("]") {
                    items.push(self.expr()?);
                    if !self.eat_sym(",") {
                        self.expect_sym("]")?;
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            Tok::Sym("{") => {
                let mut entries = Vec::new();
                while !self.eat_sym("}") {
                    let k = self.expr()?;
                    self.expect_sym(":")?;
                    let v = self.expr()?;
                    entries.push((k, v));
                    if !self.eat_sym(",") {
                        self.expect_sym("}")?;
                        break;
                    }
                }
                Ok(Expr::Dict(entries))
            }
            other => {
                self.i -= 1;
                Err(self.err(format!("unexpected {}", describe(&other))))
            }
        }
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Int(n) => format!("number {n}"),
        Tok::Float(f) => format!("number {f}"),
        Tok::Str(_) => "string".to_string(),
        Tok::Ident(name) => format!("name '{name}'"),
        Tok::Kw(k) => format!("'{k}'"),
        Tok::Sym(s) => format!("'{s}'"),
        Tok::Newline => "end of line".to_string(),
        Tok::Eof => "end of input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let e = parse_expression("1 + 2 * 3").unwrap();
        assert_eq!(
            e,
            Expr::Bin(
                BinOp::Add,
                Box::new(Expr::Int(1)),
                Box::new(Expr::Bin(BinOp::Mul, Box::new(Expr::Int(2)), Box::new(Expr::Int(3))))
            )
        );
    }

    #[test]
    fn test_call_with_kwargs_and_method() {
        let e = parse_expression("grab(p, 'out', commit=c).upper()").unwrap();
        let Expr::Call { func, args, kwargs } = e else {
            panic!("expected call");
        };
        assert!(args.is_empty() && kwargs.is_empty());
        let Expr::Attr(inner, method) = *func else {
            panic!("expected attribute");
        };
        assert_eq!(method, "upper");
        let Expr::Call { args, kwargs, .. } = *inner else {
            panic!("expected inner call");
        };
        assert_eq!(args.len(), 2);
        assert_eq!(kwargs[0].0, "commit");
    }

    #[test]
    fn test_statements() {
        let prog = parse_program("x = 1\n\n# note\nd['k'] = x + 1\nprint(x)\n").unwrap();
        assert_eq!(prog.len(), 3);
        assert!(matches!(prog[0], Stmt::Assign { ref name, .. } if name == "x"));
        assert!(matches!(prog[1], Stmt::AssignIndex { line: 4, .. }));
        assert!(matches!(prog[2], Stmt::Expr { line: 5, .. }));
    }

    #[test]
    fn test_not_in_and_conditional() {
        let e = parse_expression("1 if 'a' not in xs else 2").unwrap();
        let Expr::Cond { cond, .. } = e else {
            panic!("expected conditional");
        };
        assert!(matches!(*cond, Expr::Compare(_, ref ops) if ops[0].0 == CmpOp::NotIn));
    }

    #[test]
    fn test_multiline_collection() {
        let prog = parse_program("xs = [\n  1,\n  2,\n]\ny = 3\n").unwrap();
        assert_eq!(prog.len(), 2);
        assert_eq!(prog[1].line(), 5);
    }

    #[test]
    fn test_errors_report_line() {
        let err = parse_program("a = 1\nb = (2 +\n").unwrap_err();
        assert!(matches!(err, ScriptError::Parse { .. }));
        assert!(parse_program("1 = 2\n").is_err());
        assert!(parse_expression("1 2").is_err());
    }
}
