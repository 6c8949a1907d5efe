//! Expression evaluation: a single dispatch over the tagged AST.

use chrono::{Datelike, Days, NaiveDate};
use rand::Rng;

use super::parser::{BinOp, Expr};
use super::{EvalContext, EvalError, Value};

/// Floor division, matching the semantics expressions were authored against
/// (quotient rounds toward negative infinity).
fn floor_div(a: i64, b: i64) -> Result<i64, EvalError> {
    if b == 0 {
        return Err(EvalError::DivisionByZero);
    }
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

/// Modulo whose result takes the sign of the divisor, paired with
/// [`floor_div`] so `a == floor_div(a, b) * b + floor_mod(a, b)` holds.
fn floor_mod(a: i64, b: i64) -> Result<i64, EvalError> {
    Ok(a - floor_div(a, b)? * b)
}

fn int_arg(function: &str, value: &Value) -> Result<i64, EvalError> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(EvalError::TypeMismatch(format!(
            "{}() expected int, got {}",
            function,
            other.type_name()
        ))),
    }
}

fn str_arg<'a>(function: &str, value: &'a Value) -> Result<&'a str, EvalError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(EvalError::TypeMismatch(format!(
            "{}() expected str, got {}",
            function,
            other.type_name()
        ))),
    }
}

fn date_arg(function: &str, value: &Value) -> Result<NaiveDate, EvalError> {
    match value {
        Value::Date(d) => Ok(*d),
        other => Err(EvalError::TypeMismatch(format!(
            "{}() expected date, got {}",
            function,
            other.type_name()
        ))),
    }
}

fn arity(function: &str, expected: &'static str, ok: bool, got: usize) -> Result<(), EvalError> {
    if ok {
        Ok(())
    } else {
        Err(EvalError::Arity {
            function: function.to_string(),
            expected,
            got,
        })
    }
}

/// Resolve a possibly-negative index against a length, slice style: negative
/// counts from the end, and the result is clamped to `0..=len`.
fn slice_bound(idx: i64, len: usize) -> usize {
    let len = len as i64;
    let resolved = if idx < 0 { len + idx } else { idx };
    resolved.clamp(0, len) as usize
}

fn call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "substr" => {
            arity(name, "2 or 3", args.len() == 2 || args.len() == 3, args.len())?;
            let chars: Vec<char> = str_arg(name, &args[0])?.chars().collect();
            let start = slice_bound(int_arg(name, &args[1])?, chars.len());
            let end = match args.get(2) {
                Some(v) => slice_bound(int_arg(name, v)?, chars.len()),
                None => chars.len(),
            };
            if start >= end {
                return Ok(Value::Str(String::new()));
            }
            Ok(Value::Str(chars[start..end].iter().collect()))
        }
        "len" => {
            arity(name, "1", args.len() == 1, args.len())?;
            Ok(Value::Int(str_arg(name, &args[0])?.chars().count() as i64))
        }
        "tok" => {
            arity(name, "3", args.len() == 3, args.len())?;
            let s = str_arg(name, &args[0])?;
            let sep = str_arg(name, &args[1])?;
            if sep.is_empty() {
                return Err(EvalError::OutOfRange("tok() separator is empty".into()));
            }
            let parts: Vec<&str> = s.split(sep).collect();
            let idx = int_arg(name, &args[2])?;
            let resolved = if idx < 0 { parts.len() as i64 + idx } else { idx };
            if resolved < 0 || resolved >= parts.len() as i64 {
                return Err(EvalError::OutOfRange(format!(
                    "tok() index {} out of range for {} parts",
                    idx,
                    parts.len()
                )));
            }
            Ok(Value::Str(parts[resolved as usize].to_string()))
        }
        "cap" => {
            arity(name, "1", args.len() == 1, args.len())?;
            let s = str_arg(name, &args[0])?;
            let mut chars = s.chars();
            let capped = match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>()
                        + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            };
            Ok(Value::Str(capped))
        }
        "upper" => {
            arity(name, "1", args.len() == 1, args.len())?;
            Ok(Value::Str(str_arg(name, &args[0])?.to_uppercase()))
        }
        "lower" => {
            arity(name, "1", args.len() == 1, args.len())?;
            Ok(Value::Str(str_arg(name, &args[0])?.to_lowercase()))
        }
        "padl" | "padr" => {
            arity(name, "3", args.len() == 3, args.len())?;
            let s = str_arg(name, &args[0])?;
            let pad = str_arg(name, &args[1])?;
            let minlen = int_arg(name, &args[2])?;
            let mut pad_chars = pad.chars();
            let pad_char = match (pad_chars.next(), pad_chars.next()) {
                (Some(c), None) => c,
                _ => {
                    return Err(EvalError::TypeMismatch(format!(
                        "{}() pad must be a single character",
                        name
                    )));
                }
            };
            if minlen < 0 {
                return Err(EvalError::OutOfRange(format!(
                    "{}() minimum length is negative",
                    name
                )));
            }
            let current = s.chars().count();
            let missing = (minlen as usize).saturating_sub(current);
            let filler: String = std::iter::repeat(pad_char).take(missing).collect();
            let padded = if name == "padl" {
                filler + s
            } else {
                s.to_string() + &filler
            };
            Ok(Value::Str(padded))
        }
        "if" => {
            arity(name, "3", args.len() == 3, args.len())?;
            if args[0].is_truthy() {
                Ok(args[1].clone())
            } else {
                Ok(args[2].clone())
            }
        }
        "str" => {
            arity(name, "1", args.len() == 1, args.len())?;
            match &args[0] {
                Value::Int(n) => Ok(Value::Str(n.to_string())),
                Value::Str(s) => Ok(Value::Str(s.clone())),
                Value::Bool(b) => Ok(Value::Str(b.to_string())),
                // documented: str() does not work for dates
                Value::Date(_) => Err(EvalError::TypeMismatch(
                    "str() does not accept dates".into(),
                )),
            }
        }
        "int" => {
            arity(name, "1", args.len() == 1, args.len())?;
            match &args[0] {
                Value::Int(n) => Ok(Value::Int(*n)),
                Value::Bool(b) => Ok(Value::Int(*b as i64)),
                Value::Str(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| {
                        EvalError::TypeMismatch(format!("int() cannot parse '{}'", s))
                    }),
                Value::Date(_) => Err(EvalError::TypeMismatch(
                    "int() does not accept dates".into(),
                )),
            }
        }
        "date" => {
            arity(name, "3", args.len() == 3, args.len())?;
            let year = int_arg(name, &args[0])?;
            let month = int_arg(name, &args[1])?;
            let day = int_arg(name, &args[2])?;
            let year_i32 = i32::try_from(year)
                .map_err(|_| EvalError::OutOfRange(format!("date() year {}", year)))?;
            let month_u32 = u32::try_from(month)
                .map_err(|_| EvalError::OutOfRange(format!("date() month {}", month)))?;
            let day_u32 = u32::try_from(day)
                .map_err(|_| EvalError::OutOfRange(format!("date() day {}", day)))?;
            NaiveDate::from_ymd_opt(year_i32, month_u32, day_u32)
                .map(Value::Date)
                .ok_or_else(|| {
                    EvalError::OutOfRange(format!(
                        "date({}, {}, {}) is not a valid date",
                        year, month, day
                    ))
                })
        }
        "dyear" => {
            arity(name, "1", args.len() == 1, args.len())?;
            Ok(Value::Int(date_arg(name, &args[0])?.year() as i64))
        }
        "dmon" => {
            arity(name, "1", args.len() == 1, args.len())?;
            Ok(Value::Int(date_arg(name, &args[0])?.month() as i64))
        }
        "dday" => {
            arity(name, "1", args.len() == 1, args.len())?;
            Ok(Value::Int(date_arg(name, &args[0])?.day() as i64))
        }
        "dadd" => {
            arity(name, "2", args.len() == 2, args.len())?;
            let date = date_arg(name, &args[0])?;
            let days = int_arg(name, &args[1])?;
            let shifted = if days >= 0 {
                date.checked_add_days(Days::new(days as u64))
            } else {
                date.checked_sub_days(Days::new(days.unsigned_abs()))
            };
            shifted.map(Value::Date).ok_or_else(|| {
                EvalError::OutOfRange(format!("dadd() offset {} overflows", days))
            })
        }
        "min" | "max" | "unmax" => {
            arity(name, "2", args.len() == 2, args.len())?;
            let pick_first = match (&args[0], &args[1]) {
                (Value::Str(a), Value::Str(b)) => (a <= b) == (name != "max"),
                (Value::Date(a), Value::Date(b)) => (a <= b) == (name != "max"),
                (a, b) => match (a.as_int(), b.as_int()) {
                    (Some(a), Some(b)) => (a <= b) == (name != "max"),
                    _ => {
                        return Err(EvalError::TypeMismatch(format!(
                            "{}() cannot compare {} and {}",
                            name,
                            a.type_name(),
                            b.type_name()
                        )));
                    }
                },
            };
            Ok(if pick_first {
                args[0].clone()
            } else {
                args[1].clone()
            })
        }
        "random" => {
            arity(name, "2", args.len() == 2, args.len())?;
            let lo = int_arg(name, &args[0])?;
            let hi = int_arg(name, &args[1])?;
            if lo > hi {
                return Err(EvalError::OutOfRange(format!(
                    "random() empty range {}..={}",
                    lo, hi
                )));
            }
            Ok(Value::Int(rand::thread_rng().gen_range(lo..=hi)))
        }
        _ => Err(EvalError::UnknownFunction(name.to_string())),
    }
}

fn binary(op: BinOp, left: Value, right: Value) -> Result<Value, EvalError> {
    match op {
        // arithmetic and ordering go through as_int(), so bools take part
        // as 0/1 and a chain like `3 > 2 > 1` keeps reducing left to right
        BinOp::Add => match (left, right) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
            (a, b) => match (a.as_int(), b.as_int()) {
                (Some(a), Some(b)) => Ok(Value::Int(a.wrapping_add(b))),
                _ => Err(EvalError::TypeMismatch(format!(
                    "cannot add {} and {}",
                    a.type_name(),
                    b.type_name()
                ))),
            },
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            let (Some(a), Some(b)) = (left.as_int(), right.as_int()) else {
                return Err(EvalError::TypeMismatch(format!(
                    "arithmetic requires ints, got {} and {}",
                    left.type_name(),
                    right.type_name()
                )));
            };
            let result = match op {
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div => floor_div(a, b)?,
                BinOp::Mod => floor_mod(a, b)?,
                _ => unreachable!(),
            };
            Ok(Value::Int(result))
        }
        BinOp::Gt | BinOp::Ge | BinOp::Lt | BinOp::Le => {
            let ordering = match (&left, &right) {
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                (Value::Date(a), Value::Date(b)) => a.cmp(b),
                (a, b) => match (a.as_int(), b.as_int()) {
                    (Some(a), Some(b)) => a.cmp(&b),
                    _ => {
                        return Err(EvalError::TypeMismatch(format!(
                            "cannot order {} and {}",
                            a.type_name(),
                            b.type_name()
                        )));
                    }
                },
            };
            let result = match op {
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::Eq | BinOp::Ne => {
            let equal = match (&left, &right) {
                (Value::Str(a), Value::Str(b)) => a == b,
                (Value::Date(a), Value::Date(b)) => a == b,
                (a, b) => match (a.as_int(), b.as_int()) {
                    (Some(a), Some(b)) => a == b,
                    _ => {
                        return Err(EvalError::TypeMismatch(format!(
                            "cannot compare {} and {}",
                            a.type_name(),
                            b.type_name()
                        )));
                    }
                },
            };
            Ok(Value::Bool(if op == BinOp::Eq { equal } else { !equal }))
        }
        // || and && select an operand rather than normalising to bool
        BinOp::Or => Ok(if left.is_truthy() { left } else { right }),
        BinOp::And => Ok(if left.is_truthy() { right } else { left }),
    }
}

pub fn eval(expr: &Expr, ctx: &EvalContext) -> Result<Value, EvalError> {
    match expr {
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Var(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
        Expr::Neg(inner) => match eval(inner, ctx)? {
            Value::Int(n) => Ok(Value::Int(n.wrapping_neg())),
            other => Err(EvalError::TypeMismatch(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        },
        Expr::Binary(op, left, right) => {
            // || and && do not short-circuit: both sides always evaluate,
            // so a bad right operand errors even when the left side would
            // decide the result
            let left = eval(left, ctx)?;
            let right = eval(right, ctx)?;
            binary(*op, left, right)
        }
        Expr::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, ctx)?);
            }
            call(name, &values)
        }
    }
}
