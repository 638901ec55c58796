//! Tree-walking interpreter over a single flat scope

use super::ScriptError;
use super::builtins;
use super::parser::{BinOp, CmpOp, Expr, Stmt};
use super::value::Value;
use super::{Context, Output};
use indexmap::IndexMap;
use std::collections::HashMap;

pub(crate) struct Interp<'a> {
    vars: HashMap<String, Value>,
    pub(crate) ctx: Context<'a>,
    pub(crate) output: Vec<Output>,
    line: usize,
}

impl<'a> Interp<'a> {
    pub(crate) fn new(ctx: Context<'a>) -> Self {
        Self {
            vars: HashMap::new(),
            ctx,
            output: Vec::new(),
            line: 0,
        }
    }

    pub(crate) fn line(&self) -> usize {
        self.line
    }

    pub(crate) fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub(crate) fn run(&mut self, program: &[Stmt]) -> Result<(), ScriptError> {
        for stmt in program {
            self.line = stmt.line();
            self.exec(stmt)?;
        }
        Ok(())
    }

    fn err(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Runtime {
            line: self.line,
            message: message.into(),
        }
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<(), ScriptError> {
        match stmt {
            Stmt::Assign { name, value, .. } => {
                let v = self.eval(value)?;
                self.vars.insert(name.clone(), v);
            }
            Stmt::AssignIndex {
                name, index, value, ..
            } => {
                let key = self.eval(index)?;
                let v = self.eval(value)?;
                let line = self.line;
                let Some(target) = self.vars.get_mut(name) else {
                    return Err(self.err(format!("name '{name}' is not defined")));
                };
                set_item(target, key, v).map_err(|message| ScriptError::Runtime { line, message })?;
            }
            Stmt::Expr { expr, .. } => {
                self.eval(expr)?;
            }
        }
        Ok(())
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> Result<Value, ScriptError> {
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::List(out))
            }
            Expr::Dict(entries) => {
                let mut out = IndexMap::new();
                for (k, v) in entries {
                    let key = match self.eval(k)? {
                        Value::Str(s) => s,
                        other => {
                            return Err(self.err(format!(
                                "dict keys must be str, not {}",
                                other.type_name()
                            )));
                        }
                    };
                    let value = self.eval(v)?;
                    out.insert(key, value);
                }
                Ok(Value::Dict(out))
            }
            Expr::Neg(inner) => {
                let v = self.eval(inner)?;
                negate(v).map_err(|m| self.err(m))
            }
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.truthy())),
            Expr::Bin(op, l, r) => {
                let l = self.eval(l)?;
                let r = self.eval(r)?;
                binary(*op, l, r).map_err(|m| self.err(m))
            }
            Expr::And(l, r) => {
                let l = self.eval(l)?;
                if !l.truthy() { Ok(l) } else { self.eval(r) }
            }
            Expr::Or(l, r) => {
                let l = self.eval(l)?;
                if l.truthy() { Ok(l) } else { self.eval(r) }
            }
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first)?;
                for (op, right) in rest {
                    let right = self.eval(right)?;
                    if !compare(*op, &left, &right).map_err(|m| self.err(m))? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Cond {
                then,
                cond,
                otherwise,
            } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Call { func, args, kwargs } => {
                let func = self.eval(func)?;
                let mut pos = Vec::with_capacity(args.len());
                for a in args {
                    pos.push(self.eval(a)?);
                }
                let mut kw = Vec::with_capacity(kwargs.len());
                for (name, a) in kwargs {
                    kw.push((name.clone(), self.eval(a)?));
                }
                let result = match func {
                    Value::Builtin(name) => builtins::call(self, name, pos, kw),
                    Value::Method(recv, name) => builtins::call_method(*recv, &name, pos, kw),
                    other => Err(format!("'{}' object is not callable", other.type_name())),
                };
                result.map_err(|m| self.err(m))
            }
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                get_item(&base, &index).map_err(|m| self.err(m))
            }
            Expr::Attr(base, name) => {
                let base = self.eval(base)?;
                builtins::attribute(base, name).map_err(|m| self.err(m))
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, ScriptError> {
        if let Some(v) = self.vars.get(name) {
            return Ok(v.clone());
        }
        match builtins::lookup(name) {
            Some(builtin) => Ok(Value::Builtin(builtin)),
            None => Err(self.err(format!("name '{name}' is not defined"))),
        }
    }
}

fn negate(v: Value) -> Result<Value, String> {
    match v {
        Value::Int(n) => n
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| "integer overflow".to_string()),
        Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
        Value::Float(f) => Ok(Value::Float(-f)),
        other => Err(format!("bad operand type for unary -: '{}'", other.type_name())),
    }
}

fn int_pair(l: &Value, r: &Value) -> Option<(i64, i64)> {
    match (l, r) {
        (Value::Int(_) | Value::Bool(_), Value::Int(_) | Value::Bool(_)) => {
            Some((l.as_i64()?, r.as_i64()?))
        }
        _ => None,
    }
}

fn float_pair(l: &Value, r: &Value) -> Option<(f64, f64)> {
    Some((l.as_f64()?, r.as_f64()?))
}

fn overflow() -> String {
    "integer overflow".to_string()
}

/// Longest string or list a script may build
pub(crate) const MAX_SEQUENCE_LEN: usize = 1 << 24;

/// Length of `len` repeated `n` times, bounded by [`MAX_SEQUENCE_LEN`]
pub(crate) fn repeated_len(len: usize, n: i64) -> Result<usize, String> {
    let n = usize::try_from(n).unwrap_or(0);
    len.checked_mul(n)
        .filter(|total| *total <= MAX_SEQUENCE_LEN)
        .ok_or_else(|| format!("result too large (limit is {MAX_SEQUENCE_LEN} items)"))
}

fn repeat<T: Clone>(items: &[T], n: i64) -> Result<Vec<T>, String> {
    let total = repeated_len(items.len(), n)?;
    Ok(items.iter().cloned().cycle().take(total).collect())
}

/// Apply a binary operator with Python semantics
pub(crate) fn binary(op: BinOp, l: Value, r: Value) -> Result<Value, String> {
    let unsupported = |l: &Value, r: &Value, sym: &str| {
        format!(
            "unsupported operand type(s) for {sym}: '{}' and '{}'",
            l.type_name(),
            r.type_name()
        )
    };
    match op {
        BinOp::Add => match (&l, &r) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
            (Value::List(a), Value::List(b)) => {
                Ok(Value::List(a.iter().chain(b).cloned().collect()))
            }
            _ => {
                if let Some((a, b)) = int_pair(&l, &r) {
                    a.checked_add(b).map(Value::Int).ok_or_else(overflow)
                } else if let Some((a, b)) = float_pair(&l, &r) {
                    Ok(Value::Float(a + b))
                } else {
                    Err(unsupported(&l, &r, "+"))
                }
            }
        },
        BinOp::Sub => {
            if let Some((a, b)) = int_pair(&l, &r) {
                a.checked_sub(b).map(Value::Int).ok_or_else(overflow)
            } else if let Some((a, b)) = float_pair(&l, &r) {
                Ok(Value::Float(a - b))
            } else {
                Err(unsupported(&l, &r, "-"))
            }
        }
        BinOp::Mul => match (&l, &r) {
            (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
                repeated_len(s.len(), *n)?;
                Ok(Value::Str(s.repeat(usize::try_from(*n).unwrap_or(0))))
            }
            (Value::List(items), Value::Int(n)) | (Value::Int(n), Value::List(items)) => {
                repeat(items, *n).map(Value::List)
            }
            _ => {
                if let Some((a, b)) = int_pair(&l, &r) {
                    a.checked_mul(b).map(Value::Int).ok_or_else(overflow)
                } else if let Some((a, b)) = float_pair(&l, &r) {
                    Ok(Value::Float(a * b))
                } else {
                    Err(unsupported(&l, &r, "*"))
                }
            }
        },
        BinOp::Div => match (&l, &r) {
            (Value::Path(p), Value::Str(s)) => Ok(Value::Path(p.join(s))),
            (Value::Path(p), Value::Path(q)) => Ok(Value::Path(p.join(q))),
            (Value::Str(s), Value::Path(q)) => Ok(Value::Path(std::path::Path::new(s).join(q))),
            _ => {
                let Some((a, b)) = float_pair(&l, &r) else {
                    return Err(unsupported(&l, &r, "/"));
                };
                if b == 0.0 {
                    return Err("division by zero".to_string());
                }
                Ok(Value::Float(a / b))
            }
        },
        BinOp::FloorDiv => {
            if let Some((a, b)) = int_pair(&l, &r) {
                if b == 0 {
                    return Err("integer division or modulo by zero".to_string());
                }
                let q = a.checked_div(b).ok_or_else(overflow)?;
                let adjust = a % b != 0 && ((a < 0) != (b < 0));
                Ok(Value::Int(if adjust { q - 1 } else { q }))
            } else if let Some((a, b)) = float_pair(&l, &r) {
                if b == 0.0 {
                    return Err("float floor division by zero".to_string());
                }
                Ok(Value::Float((a / b).floor()))
            } else {
                Err(unsupported(&l, &r, "//"))
            }
        }
        BinOp::Mod => {
            if let Some((a, b)) = int_pair(&l, &r) {
                if b == 0 {
                    return Err("integer division or modulo by zero".to_string());
                }
                let m = a.checked_rem(b).ok_or_else(overflow)?;
                Ok(Value::Int(if m != 0 && ((m < 0) != (b < 0)) { m + b } else { m }))
            } else if let Some((a, b)) = float_pair(&l, &r) {
                if b == 0.0 {
                    return Err("float modulo".to_string());
                }
                Ok(Value::Float(a - b * (a / b).floor()))
            } else {
                Err(unsupported(&l, &r, "%"))
            }
        }
        BinOp::Pow => {
            if let Some((a, b)) = int_pair(&l, &r)
                && b >= 0
            {
                let exp = u32::try_from(b).map_err(|_| overflow())?;
                a.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
            } else if let Some((a, b)) = float_pair(&l, &r) {
                Ok(Value::Float(a.powf(b)))
            } else {
                Err(unsupported(&l, &r, "**"))
            }
        }
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, String> {
    use std::cmp::Ordering::*;
    let ordered = |sym: &str| {
        l.compare(r).ok_or_else(|| {
            format!(
                "'{sym}' not supported between instances of '{}' and '{}'",
                l.type_name(),
                r.type_name()
            )
        })
    };
    Ok(match op {
        CmpOp::Eq => l.loose_eq(r),
        CmpOp::Ne => !l.loose_eq(r),
        CmpOp::Lt => ordered("<")? == Less,
        CmpOp::Le => ordered("<=")? != Greater,
        CmpOp::Gt => ordered(">")? == Greater,
        CmpOp::Ge => ordered(">=")? != Less,
        CmpOp::In => contains(r, l)?,
        CmpOp::NotIn => !contains(r, l)?,
    })
}

fn contains(container: &Value, item: &Value) -> Result<bool, String> {
    match (container, item) {
        (Value::Str(hay), Value::Str(needle)) => Ok(hay.contains(needle.as_str())),
        (Value::List(items), _) => Ok(items.iter().any(|x| x.loose_eq(item))),
        (Value::Dict(map), Value::Str(key)) => Ok(map.contains_key(key)),
        (Value::Dict(_), _) => Ok(false),
        _ => Err(format!(
            "argument of type '{}' is not iterable",
            container.type_name()
        )),
    }
}

fn list_index(len: usize, index: &Value) -> Result<usize, String> {
    let Some(i) = index.as_i64() else {
        return Err(format!(
            "indices must be integers, not {}",
            index.type_name()
        ));
    };
    let len = i64::try_from(len).map_err(|_| overflow())?;
    let i = if i < 0 { i + len } else { i };
    if (0..len).contains(&i) {
        usize::try_from(i).map_err(|_| overflow())
    } else {
        Err("index out of range".to_string())
    }
}

fn get_item(base: &Value, index: &Value) -> Result<Value, String> {
    match base {
        Value::List(items) => Ok(items[list_index(items.len(), index)?].clone()),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(chars[list_index(chars.len(), index)?].to_string()))
        }
        Value::Dict(map) => {
            let Value::Str(key) = index else {
                return Err(format!("KeyError: {}", index.repr()));
            };
            map.get(key)
                .cloned()
                .ok_or_else(|| format!("KeyError: {}", index.repr()))
        }
        other => Err(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        )),
    }
}

fn set_item(target: &mut Value, index: Value, value: Value) -> Result<(), String> {
    match target {
        Value::List(items) => {
            let i = list_index(items.len(), &index)?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(map) => match index {
            Value::Str(key) => {
                map.insert(key, value);
                Ok(())
            }
            other => Err(format!("dict keys must be str, not {}", other.type_name())),
        },
        other => Err(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse_program;
    use super::super::{Context, NoHost};
    use super::*;
    use crate::retry::{RetryPolicy, SystemClock};

    fn run(src: &str) -> Result<Interp<'static>, ScriptError> {
        static HOST: NoHost = NoHost;
        static CLOCK: SystemClock = SystemClock;
        let mut interp = Interp::new(Context {
            host: &HOST,
            clock: &CLOCK,
            tag_retry: RetryPolicy::once(),
        });
        interp.run(&parse_program(src)?)?;
        Ok(interp)
    }

    fn value_of(src: &str) -> Value {
        let interp = run(&format!("r = {src}\n")).unwrap();
        interp.var("r").cloned().unwrap()
    }

    #[test]
    fn test_arithmetic_semantics() {
        assert_eq!(value_of("1 + 1"), Value::Int(2));
        assert_eq!(value_of("7 / 2"), Value::Float(3.5));
        assert_eq!(value_of("-7 // 2"), Value::Int(-4));
        assert_eq!(value_of("-7 % 3"), Value::Int(2));
        assert_eq!(value_of("2 ** 10"), Value::Int(1024));
        assert_eq!(value_of("2 ** -1"), Value::Float(0.5));
        assert_eq!(value_of("-2 ** 2"), Value::Int(-4));
        assert_eq!(value_of("'ab' * 2"), Value::Str("abab".into()));
        assert_eq!(value_of("True + 1"), Value::Int(2));
    }

    #[test]
    fn test_oversized_repetition_is_an_error() {
        let err = run("r = 'ab' * 9223372036854775807\n").err().unwrap();
        assert!(err.to_string().contains("result too large"));
        let err = run("r = [1, 2, 3] * 9223372036854775807\n").err().unwrap();
        assert!(err.to_string().contains("result too large"));
        assert_eq!(value_of("[0] * -3"), Value::List(vec![]));
        assert_eq!(value_of("'x' * 0"), Value::Str(String::new()));
    }

    #[test]
    fn test_paths_join_with_slash() {
        assert_eq!(
            value_of("Path('/a') / 'b' / 'c.txt'"),
            Value::Path("/a/b/c.txt".into())
        );
    }

    #[test]
    fn test_logic_and_comparisons() {
        assert_eq!(value_of("1 < 2 < 3"), Value::Bool(true));
        assert_eq!(value_of("1 < 3 < 2"), Value::Bool(false));
        assert_eq!(value_of("0 or 'x'"), Value::Str("x".into()));
        assert_eq!(value_of("'' and 1"), Value::Str(String::new()));
        assert_eq!(value_of("'b' in ['a', 'b']"), Value::Bool(true));
        assert_eq!(value_of("'k' not in {'k': 1}"), Value::Bool(false));
        assert_eq!(value_of("'yes' if 1 == 1.0 else 'no'"), Value::Str("yes".into()));
    }

    #[test]
    fn test_index_assignment_and_lookup() {
        let interp = run("d = {}\nd['a'] = [1, 2]\nx = d['a'][-1]\n").unwrap();
        assert_eq!(interp.var("x"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_runtime_errors_carry_line() {
        let err = run("a = 1\nb = a / 0\n").err().unwrap();
        assert!(matches!(err, ScriptError::Runtime { line: 2, .. }));
        let err = run("undefined_name\n").err().unwrap();
        assert!(err.to_string().contains("not defined"));
        assert!(run("x = 1 < 'a'\n").is_err());
        assert!(run("x = {}['missing']\n").is_err());
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        assert_eq!(value_of("False and 1 / 0"), Value::Bool(false));
    }
}
