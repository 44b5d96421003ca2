//! Rule compilation: a JSON-Logic document becomes an [`Expr`] tree.
use serde_json::Value;

use super::{ArithOp, CmpOp, Expr};

/// Compile a rule node. Objects must carry exactly one key naming a supported
/// operator; anything else is a compile error attributed to the owning flag.
pub(crate) fn compile(value: &Value) -> Result<Expr, String> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            Ok(Expr::Literal(value.clone()))
        }
        Value::Array(items) => Ok(Expr::Array(
            items.iter().map(compile).collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            let mut entries = map.iter();
            let (operator, args) = match (entries.next(), entries.next()) {
                (Some(entry), None) => entry,
                _ => {
                    return Err(format!(
                        "targeting rule object must have exactly one operator key, found {}",
                        map.len()
                    ))
                }
            };
            compile_operator(operator, args)
        }
    }
}

fn compile_operator(operator: &str, args: &Value) -> Result<Expr, String> {
    // Unary sugar: {"!": expr} is shorthand for {"!": [expr]}.
    let args = match args {
        Value::Array(items) => items.iter().map(compile).collect::<Result<Vec<_>, _>>()?,
        other => vec![compile(other)?],
    };

    match operator {
        "var" => {
            let mut args = check_arity(operator, args, 1..=2)?.into_iter();
            Ok(Expr::Var {
                path: Box::new(args.next().expect("arity checked")),
                default: args.next().map(Box::new),
            })
        }
        "missing" => Ok(Expr::Missing(args)),
        "missing_some" => {
            let [min, keys] = exactly_two(operator, args)?;
            Ok(Expr::MissingSome(Box::new(min), Box::new(keys)))
        }
        "if" | "?:" => Ok(Expr::If(args)),
        "==" => binary(operator, args, Expr::Eq),
        "===" => binary(operator, args, Expr::StrictEq),
        "!=" => binary(operator, args, Expr::Ne),
        "!==" => binary(operator, args, Expr::StrictNe),
        "!" => unary(operator, args, Expr::Not),
        "!!" => unary(operator, args, Expr::Truthy),
        "and" => at_least_one(operator, args, Expr::And),
        "or" => at_least_one(operator, args, Expr::Or),
        "<" => comparison(operator, args, CmpOp::Lt),
        "<=" => comparison(operator, args, CmpOp::Le),
        ">" => comparison(operator, args, CmpOp::Gt),
        ">=" => comparison(operator, args, CmpOp::Ge),
        "in" => binary(operator, args, Expr::In),
        "cat" => Ok(Expr::Cat(args)),
        "substr" => {
            let args = check_arity(operator, args, 2..=3)?;
            Ok(Expr::Substr(args))
        }
        "+" => at_least_one(operator, args, |args| Expr::Arith(ArithOp::Add, args)),
        "*" => at_least_one(operator, args, |args| Expr::Arith(ArithOp::Mul, args)),
        "-" => {
            let args = check_arity(operator, args, 1..=2)?;
            Ok(Expr::Arith(ArithOp::Sub, args))
        }
        "/" => {
            let args = check_arity(operator, args, 2..=2)?;
            Ok(Expr::Arith(ArithOp::Div, args))
        }
        "%" => {
            let args = check_arity(operator, args, 2..=2)?;
            Ok(Expr::Arith(ArithOp::Mod, args))
        }
        // Custom operators keep their raw argument lists; they validate shape
        // at evaluation time and yield Null on misconfiguration.
        "fractional" => Ok(Expr::Fractional(args)),
        "starts_with" => Ok(Expr::StartsWith(args)),
        "ends_with" => Ok(Expr::EndsWith(args)),
        "sem_ver" => Ok(Expr::SemVer(args)),
        other => Err(format!("unknown targeting operator: {other}")),
    }
}

fn check_arity(
    operator: &str,
    args: Vec<Expr>,
    expected: std::ops::RangeInclusive<usize>,
) -> Result<Vec<Expr>, String> {
    if expected.contains(&args.len()) {
        Ok(args)
    } else {
        Err(format!(
            "operator \"{operator}\" expects {}..={} arguments, got {}",
            expected.start(),
            expected.end(),
            args.len()
        ))
    }
}

fn exactly_two(operator: &str, args: Vec<Expr>) -> Result<[Expr; 2], String> {
    let mut args = check_arity(operator, args, 2..=2)?.into_iter();
    Ok([
        args.next().expect("arity checked"),
        args.next().expect("arity checked"),
    ])
}

fn binary(
    operator: &str,
    args: Vec<Expr>,
    build: impl FnOnce(Box<Expr>, Box<Expr>) -> Expr,
) -> Result<Expr, String> {
    let [a, b] = exactly_two(operator, args)?;
    Ok(build(Box::new(a), Box::new(b)))
}

fn unary(
    operator: &str,
    args: Vec<Expr>,
    build: impl FnOnce(Box<Expr>) -> Expr,
) -> Result<Expr, String> {
    let mut args = check_arity(operator, args, 1..=1)?.into_iter();
    Ok(build(Box::new(args.next().expect("arity checked"))))
}

fn at_least_one(
    operator: &str,
    args: Vec<Expr>,
    build: impl FnOnce(Vec<Expr>) -> Expr,
) -> Result<Expr, String> {
    if args.is_empty() {
        return Err(format!("operator \"{operator}\" expects at least one argument"));
    }
    Ok(build(args))
}

fn comparison(operator: &str, args: Vec<Expr>, op: CmpOp) -> Result<Expr, String> {
    // The 3-argument form (between) only makes sense for < and <=.
    let max = if matches!(op, CmpOp::Lt | CmpOp::Le) { 3 } else { 2 };
    let args = check_arity(operator, args, 2..=max)?;
    Ok(Expr::Compare(op, args))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::compile;
    use crate::targeting::Expr;

    #[test]
    fn literals_compile_to_literal_nodes() {
        assert_eq!(compile(&json!("on")).unwrap(), Expr::Literal(json!("on")));
        assert_eq!(compile(&json!(3)).unwrap(), Expr::Literal(json!(3)));
        assert_eq!(compile(&json!(null)).unwrap(), Expr::Literal(json!(null)));
    }

    #[test]
    fn unary_sugar_wraps_single_argument() {
        let sugar = compile(&json!({"!": {"var": "x"}})).unwrap();
        let explicit = compile(&json!({"!": [{"var": "x"}]})).unwrap();
        assert_eq!(sugar, explicit);
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(compile(&json!({"==": [1]})).is_err());
        assert!(compile(&json!({"/": [1, 2, 3]})).is_err());
        assert!(compile(&json!({"var": []})).is_err());
    }

    #[test]
    fn rejects_multi_key_objects() {
        let err = compile(&json!({"==": [1, 1], "!=": [1, 2]})).unwrap_err();
        assert!(err.contains("exactly one operator"), "{err}");
    }

    #[test]
    fn rejects_between_form_for_greater_than() {
        assert!(compile(&json!({"<": [1, {"var": "x"}, 10]})).is_ok());
        assert!(compile(&json!({">": [10, {"var": "x"}, 1]})).is_err());
    }

    #[test]
    fn custom_operators_accept_any_arity() {
        assert!(compile(&json!({"starts_with": []})).is_ok());
        assert!(compile(&json!({"fractional": [["a", 50], ["b", 50]]})).is_ok());
    }
}
