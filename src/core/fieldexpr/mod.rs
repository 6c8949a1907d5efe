//! Field-expression language used to compute form answers.
//!
//! Administrators store one expression per form field (`target_value`); at
//! fill time the expression is evaluated against a per-student context to
//! produce the concrete value typed into the form. The language has four
//! value types (int, str, date, bool), `$variables`, and a fixed set of
//! built-in functions. Comparison and logical operators share a single
//! precedence tier below arithmetic and associate strictly left to right;
//! this is long-standing documented behaviour that authored expressions
//! depend on, so it is preserved as-is.

mod eval;
mod lexer;
mod parser;

use std::collections::HashMap;

use chrono::NaiveDate;

pub use parser::Expr;

/// A value produced by evaluating an expression.
///
/// `Bool` is only reachable through comparisons; there is no boolean literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(String),
    Date(NaiveDate),
    Bool(bool),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::Date(_) => "date",
            Value::Bool(_) => "bool",
        }
    }

    /// Numeric view of a value. Bools count as ints (`false` is 0, `true`
    /// is 1), so chained comparisons like `3 > 2 > 1` keep evaluating left
    /// to right and a bare comparison can drive an option index.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Truthiness used by `if`, `||` and `&&`: zero, empty string and false
    /// are falsy, everything else (including any date) is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
            Value::Date(_) => true,
            Value::Bool(b) => *b,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Everything that can go wrong while parsing or evaluating an expression.
///
/// These are scoped to a single form field; the executor decides whether an
/// error aborts the whole fill based on the field's `critical` flag.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    Parse(String),
    UnknownVariable(String),
    UnknownFunction(String),
    Arity {
        function: String,
        expected: &'static str,
        got: usize,
    },
    TypeMismatch(String),
    DivisionByZero,
    OutOfRange(String),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalError::Parse(msg) => write!(f, "parse error: {}", msg),
            EvalError::UnknownVariable(name) => write!(f, "unknown variable ${}", name),
            EvalError::UnknownFunction(name) => write!(f, "unknown function {}()", name),
            EvalError::Arity {
                function,
                expected,
                got,
            } => write!(
                f,
                "{}() takes {} arguments but {} were given",
                function, expected, got
            ),
            EvalError::TypeMismatch(msg) => write!(f, "type mismatch: {}", msg),
            EvalError::DivisionByZero => write!(f, "division by zero"),
            EvalError::OutOfRange(msg) => write!(f, "out of range: {}", msg),
        }
    }
}

impl std::error::Error for EvalError {}

/// Variable bindings for one evaluation run.
///
/// Built from the student snapshot and the course being filled; see
/// [`crate::core::types::StudentContext`].
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    vars: HashMap<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

/// Parse `source` without evaluating it. Used to validate expressions when an
/// administrator saves a form style.
pub fn parse(source: &str) -> Result<Expr, EvalError> {
    parser::parse(&lexer::tokenize(source)?)
}

/// Parse and evaluate `source` against `ctx`.
pub fn evaluate(source: &str, ctx: &EvalContext) -> Result<Value, EvalError> {
    eval::eval(&parse(source)?, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EvalContext {
        let mut c = EvalContext::new();
        c.set("first_name", Value::Str("Ada".into()));
        c.set("last_name", Value::Str("Lovelace".into()));
        c.set("name", Value::Str("Ada Lovelace".into()));
        c.set("student_number", Value::Str("12345".into()));
        c.set("grade", Value::Int(10));
        c.set("day_cycle", Value::Int(2));
        c.set("course_code", Value::Str("MHF4U1-A".into()));
        c.set("teacher_name", Value::Str("G. Boole".into()));
        c.set(
            "today",
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
        );
        c
    }

    fn eval(src: &str) -> Value {
        evaluate(src, &ctx()).unwrap()
    }

    #[test]
    fn integer_and_string_literals() {
        assert_eq!(eval("42"), Value::Int(42));
        assert_eq!(eval("-7"), Value::Int(-7));
        assert_eq!(eval("'hello'"), Value::Str("hello".into()));
        assert_eq!(eval(r"'it\'s'"), Value::Str("it's".into()));
        assert_eq!(eval("''"), Value::Str(String::new()));
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(eval("2 + 3 * 4"), Value::Int(14));
        assert_eq!(eval("(2 + 3) * 4"), Value::Int(20));
        assert_eq!(eval("10 - 2 - 3"), Value::Int(5));
        assert_eq!(eval("7 / 2"), Value::Int(3));
        assert_eq!(eval("-7 / 2"), Value::Int(-4));
        assert_eq!(eval("7 % 3"), Value::Int(1));
        assert_eq!(eval("-1 % 3"), Value::Int(2));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(eval("'foo' + 'bar'"), Value::Str("foobar".into()));
    }

    #[test]
    fn comparisons_produce_bool() {
        assert_eq!(eval("1 < 2"), Value::Bool(true));
        assert_eq!(eval("2 <= 1"), Value::Bool(false));
        assert_eq!(eval("'a' == 'a'"), Value::Bool(true));
        assert_eq!(eval("'a' != 'b'"), Value::Bool(true));
        assert_eq!(
            eval("date(2024,1,1) < date(2024,1,2)"),
            Value::Bool(true)
        );
    }

    #[test]
    fn logical_operators_are_not_precedence_ordered() {
        // Pins the documented quirk: everything left of && has already been
        // folded into a single value, so the whole thing is
        // ((1 + 1) == 2) && 0, which selects the falsy right operand.
        assert_eq!(eval("1 + 1 == 2 && 0"), Value::Int(0));
        // and with ||, the truthy left side wins outright
        assert_eq!(eval("1 + 1 == 2 || 0"), Value::Bool(true));
        // chained comparisons fold left to right too: (1 < 2) == 1
        assert_eq!(eval("1 < 2 == 1"), Value::Bool(true));
    }

    #[test]
    fn bools_take_part_in_arithmetic_and_ordering_as_ints() {
        // 3 > 2 folds to true, which then orders as 1 against the trailing 1
        assert_eq!(eval("3 > 2 > 1"), Value::Bool(false));
        assert_eq!(eval("1 == 1 == 1"), Value::Bool(true));
        assert_eq!(eval("(1 < 2) + 1"), Value::Int(2));
        assert_eq!(eval("max(1 < 2, 0)"), Value::Bool(true));
    }

    #[test]
    fn logical_operators_select_operands() {
        assert_eq!(eval("'' || 'fallback'"), Value::Str("fallback".into()));
        assert_eq!(eval("'x' || 'y'"), Value::Str("x".into()));
        assert_eq!(eval("0 && 5"), Value::Int(0));
        assert_eq!(eval("1 && 5"), Value::Int(5));
    }

    #[test]
    fn variables_resolve_from_context() {
        assert_eq!(eval("$grade"), Value::Int(10));
        assert_eq!(eval("$first_name"), Value::Str("Ada".into()));
        assert_eq!(eval("$grade + 2"), Value::Int(12));
    }

    #[test]
    fn unknown_variable_is_an_error() {
        assert_eq!(
            evaluate("$foo", &ctx()),
            Err(EvalError::UnknownVariable("foo".into()))
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(matches!(
            evaluate("'unterminated", &ctx()),
            Err(EvalError::Parse(_))
        ));
    }

    #[test]
    fn wrong_arity_is_an_error() {
        assert!(matches!(
            evaluate("substr()", &ctx()),
            Err(EvalError::Arity { .. })
        ));
        assert!(matches!(
            evaluate("len('a', 'b')", &ctx()),
            Err(EvalError::Arity { .. })
        ));
    }

    #[test]
    fn unknown_function_is_an_error() {
        assert_eq!(
            evaluate("bogus(1)", &ctx()),
            Err(EvalError::UnknownFunction("bogus".into()))
        );
    }

    #[test]
    fn string_functions() {
        assert_eq!(eval("substr('abcdef', 1, 3)"), Value::Str("bc".into()));
        assert_eq!(eval("substr('abcdef', 2)"), Value::Str("cdef".into()));
        assert_eq!(eval("len('abc')"), Value::Int(3));
        assert_eq!(eval("tok('a,b,c', ',', 1)"), Value::Str("b".into()));
        assert_eq!(eval("cap('ada LOVELACE')"), Value::Str("Ada lovelace".into()));
        assert_eq!(eval("upper('abc')"), Value::Str("ABC".into()));
        assert_eq!(eval("lower('ABC')"), Value::Str("abc".into()));
        assert_eq!(eval("padl('7', '0', 3)"), Value::Str("007".into()));
        assert_eq!(eval("padr('7', '-', 3)"), Value::Str("7--".into()));
    }

    #[test]
    fn conversion_functions() {
        assert_eq!(eval("str(42)"), Value::Str("42".into()));
        assert_eq!(eval("int('42')"), Value::Int(42));
        assert_eq!(eval("int('-3')"), Value::Int(-3));
        assert!(matches!(
            evaluate("int('nope')", &ctx()),
            Err(EvalError::TypeMismatch(_))
        ));
        assert_eq!(
            eval("date(2024, 2, 29)"),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert!(matches!(
            evaluate("date(2023, 2, 29)", &ctx()),
            Err(EvalError::OutOfRange(_))
        ));
    }

    #[test]
    fn date_functions() {
        assert_eq!(eval("dyear($today)"), Value::Int(2024));
        assert_eq!(eval("dmon($today)"), Value::Int(1));
        assert_eq!(eval("dday($today)"), Value::Int(1));
        assert_eq!(
            eval("dadd($today, 1)"),
            Value::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
        );
        assert_eq!(
            eval("dadd($today, -1)"),
            Value::Date(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap())
        );
    }

    #[test]
    fn utility_functions() {
        assert_eq!(eval("if(1, 'a', 'b')"), Value::Str("a".into()));
        assert_eq!(eval("if(0, 'a', 'b')"), Value::Str("b".into()));
        assert_eq!(eval("if($grade > 9, 'senior', 'junior')"), Value::Str("senior".into()));
        assert_eq!(eval("min(3, 5)"), Value::Int(3));
        assert_eq!(eval("max(3, 5)"), Value::Int(5));
        let v = eval("random(1, 6)");
        match v {
            Value::Int(n) => assert!((1..=6).contains(&n)),
            other => panic!("random() produced {:?}", other),
        }
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(evaluate("1 / 0", &ctx()), Err(EvalError::DivisionByZero));
        assert_eq!(evaluate("1 % 0", &ctx()), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn mixed_type_arithmetic_is_an_error() {
        assert!(matches!(
            evaluate("'a' + 1", &ctx()),
            Err(EvalError::TypeMismatch(_))
        ));
        assert!(matches!(
            evaluate("-'a'", &ctx()),
            Err(EvalError::TypeMismatch(_))
        ));
    }

    #[test]
    fn realistic_field_expressions() {
        assert_eq!(
            eval("substr($first_name, 0, 2) + str($grade)"),
            Value::Str("Ad10".into())
        );
        assert_eq!(
            eval("$first_name + ' ' + $last_name"),
            Value::Str("Ada Lovelace".into())
        );
        assert_eq!(
            eval("tok($course_code, '-', 0)"),
            Value::Str("MHF4U1".into())
        );
    }
}
