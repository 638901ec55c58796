//! Tokenizer for the configuration expression language

use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Kw(&'static str),
    Sym(&'static str),
    Newline,
    Eof,
}

const KEYWORDS: [&str; 9] = ["True", "False", "None", "and", "or", "not", "in", "if", "else"];

// Longest first so `**` wins over `*`
const SYMBOLS: [&str; 22] = [
    "**", "//", "==", "!=", "<=", ">=", "+", "-", "*", "/", "%", "<", ">", "=", "(", ")", "[",
    "]", "{", "}", ",", ":",
];

/// A token and the 1-based line it starts on
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub tok: Tok,
    pub line: usize,
}

struct Lex {
    s: Vec<char>,
    i: usize,
    line: usize,
    depth: usize,
}

/// Split `src` into tokens.
///
/// Newlines are significant (they end statements) except inside brackets.
/// The stream always ends with `Newline, Eof`.
pub fn tokenize(src: &str) -> Result<Vec<Spanned>, ScriptError> {
    let mut lx = Lex {
        s: src.chars().collect(),
        i: 0,
        line: 1,
        depth: 0,
    };
    let mut out = Vec::new();
    loop {
        lx.skip_blank();
        let line = lx.line;
        let Some(c) = lx.peek() else {
            out.push(Spanned {
                tok: Tok::Newline,
                line,
            });
            out.push(Spanned { tok: Tok::Eof, line });
            return Ok(out);
        };
        let tok = if c == '\n' {
            lx.i += 1;
            lx.line += 1;
            if lx.depth > 0 {
                continue;
            }
            Tok::Newline
        } else if c.is_ascii_digit() || (c == '.' && lx.peek_at(1).is_some_and(|d| d.is_ascii_digit())) {
            lx.number()?
        } else if c == '\'' || c == '"' {
            lx.string(c)?
        } else if c.is_alphabetic() || c == '_' {
            let word = lx.word();
            match KEYWORDS.iter().find(|k| **k == word) {
                Some(kw) => Tok::Kw(*kw),
                None => Tok::Ident(word),
            }
        } else if c == '.' {
            lx.i += 1;
            Tok::Sym(".")
        } else {
            lx.symbol()?
        };
        out.push(Spanned { tok, line });
    }
}

impl Lex {
    fn peek(&self) -> Option<char> {
        self.s.get(self.i).copied()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.s.get(self.i + n).copied()
    }

    fn err(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn skip_blank(&mut self) {
        while let Some(c) = self.peek() {
            if c == '#' {
                while let Some(d) = self.peek() {
                    if d == '\n' {
                        break;
                    }
                    self.i += 1;
                }
            } else if c == '\\' && self.peek_at(1) == Some('\n') {
                // explicit line continuation
                self.i += 2;
                self.line += 1;
            } else if c != '\n' && c.is_whitespace() {
                self.i += 1;
            } else {
                break;
            }
        }
    }

    fn word(&mut self) -> String {
        let start = self.i;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.i += 1;
        }
        self.s[start..self.i].iter().collect()
    }

    fn number(&mut self) -> Result<Tok, ScriptError> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
            } else if c == '_' {
                // digit separator
            } else if c == '.' && !is_float {
                is_float = true;
                text.push(c);
            } else if (c == 'e' || c == 'E') && !text.is_empty() {
                is_float = true;
                text.push(c);
                if let Some(sign @ ('+' | '-')) = self.peek_at(1) {
                    text.push(sign);
                    self.i += 1;
                }
            } else {
                break;
            }
            self.i += 1;
        }
        if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| self.err(format!("invalid number literal '{text}'")))
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.err(format!("integer literal '{text}' out of range")))
        }
    }

    fn string(&mut self, quote: char) -> Result<Tok, ScriptError> {
        self.i += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.err("unterminated string literal"));
            };
            self.i += 1;
            match c {
                '\n' => return Err(self.err("unterminated string literal")),
                '\\' => {
                    let Some(e) = self.peek() else {
                        return Err(self.err("unterminated string literal"));
                    };
                    self.i += 1;
                    match e {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        '\\' | '\'' | '"' => out.push(e),
                        other => {
                            out.push('\\');
                            out.push(other);
                        }
                    }
                }
                c if c == quote => return Ok(Tok::Str(out)),
                c => out.push(c),
            }
        }
    }

    fn symbol(&mut self) -> Result<Tok, ScriptError> {
        for sym in SYMBOLS {
            let matches = sym
                .chars()
                .enumerate()
                .all(|(k, ch)| self.peek_at(k) == Some(ch));
            if matches {
                self.i += sym.len();
                match sym {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                return Ok(Tok::Sym(sym));
            }
        }
        let c = self.peek().unwrap_or(' ');
        Err(self.err(format!("unexpected character '{c}'")))
    }
}
