//! Rule evaluation: pure functions over (expression, scope).
use serde_json::{Map, Value};

use super::{ops, ArithOp, CmpOp, Expr};

/// Evaluate one expression node. Never fails: misconfigured nodes evaluate to
/// `Null`, which callers treat as "no match".
pub(crate) fn eval(expr: &Expr, scope: &Map<String, Value>) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Array(items) => Value::Array(items.iter().map(|item| eval(item, scope)).collect()),

        Expr::Var { path, default } => match lookup(&eval(path, scope), scope) {
            Some(value) => value,
            None => default
                .as_ref()
                .map(|d| eval(d, scope))
                .unwrap_or(Value::Null),
        },

        Expr::Missing(args) => Value::Array(missing_keys(args, scope)),
        Expr::MissingSome(min, keys) => {
            let min = to_number(&eval(min, scope)).unwrap_or(0.0) as usize;
            let keys = match eval(keys, scope) {
                Value::Array(keys) => keys,
                _ => return Value::Null,
            };
            let present = keys
                .iter()
                .filter(|key| lookup(key, scope).is_some())
                .count();
            if present >= min {
                Value::Array(Vec::new())
            } else {
                Value::Array(
                    keys.into_iter()
                        .filter(|key| lookup(key, scope).is_none())
                        .collect(),
                )
            }
        }

        Expr::If(args) => {
            let mut i = 0;
            while i + 1 < args.len() {
                if truthy(&eval(&args[i], scope)) {
                    return eval(&args[i + 1], scope);
                }
                i += 2;
            }
            match args.get(i) {
                Some(fallback) => eval(fallback, scope),
                None => Value::Null,
            }
        }

        Expr::Eq(a, b) => Value::Bool(loose_eq(&eval(a, scope), &eval(b, scope))),
        Expr::Ne(a, b) => Value::Bool(!loose_eq(&eval(a, scope), &eval(b, scope))),
        Expr::StrictEq(a, b) => Value::Bool(strict_eq(&eval(a, scope), &eval(b, scope))),
        Expr::StrictNe(a, b) => Value::Bool(!strict_eq(&eval(a, scope), &eval(b, scope))),

        Expr::Not(a) => Value::Bool(!truthy(&eval(a, scope))),
        Expr::Truthy(a) => Value::Bool(truthy(&eval(a, scope))),

        Expr::And(args) => {
            let mut last = Value::Null;
            for arg in args {
                last = eval(arg, scope);
                if !truthy(&last) {
                    return last;
                }
            }
            last
        }
        Expr::Or(args) => {
            let mut last = Value::Null;
            for arg in args {
                last = eval(arg, scope);
                if truthy(&last) {
                    return last;
                }
            }
            last
        }

        Expr::Compare(op, args) => {
            let values: Vec<Value> = args.iter().map(|arg| eval(arg, scope)).collect();
            let ordered = values
                .windows(2)
                .all(|pair| compare(*op, &pair[0], &pair[1]).unwrap_or(false));
            Value::Bool(ordered)
        }

        Expr::In(needle, haystack) => {
            let needle = eval(needle, scope);
            match eval(haystack, scope) {
                Value::String(s) => match needle {
                    Value::String(n) => Value::Bool(s.contains(&n)),
                    _ => Value::Bool(false),
                },
                Value::Array(items) => {
                    Value::Bool(items.iter().any(|item| loose_eq(item, &needle)))
                }
                _ => Value::Bool(false),
            }
        }

        Expr::Cat(args) => Value::String(
            args.iter()
                .map(|arg| stringify(&eval(arg, scope)))
                .collect::<String>(),
        ),

        Expr::Substr(args) => {
            let Some(Value::String(s)) = args.first().map(|a| eval(a, scope)) else {
                return Value::Null;
            };
            let chars: Vec<char> = s.chars().collect();
            let start = args
                .get(1)
                .and_then(|a| to_number(&eval(a, scope)))
                .unwrap_or(0.0) as i64;
            let start = clamp_index(start, chars.len());
            let end = match args.get(2).and_then(|a| to_number(&eval(a, scope))) {
                // Negative length omits that many characters from the end.
                Some(len) if len < 0.0 => clamp_index(len as i64, chars.len()).max(start),
                Some(len) => (start + len as usize).min(chars.len()),
                None => chars.len(),
            };
            Value::String(chars[start..end].iter().collect())
        }

        Expr::Arith(op, args) => {
            let numbers: Option<Vec<f64>> =
                args.iter().map(|arg| to_number(&eval(arg, scope))).collect();
            let Some(numbers) = numbers else {
                return Value::Null;
            };
            let result = match op {
                ArithOp::Add => numbers.iter().sum(),
                ArithOp::Mul => numbers.iter().product(),
                ArithOp::Sub if numbers.len() == 1 => -numbers[0],
                ArithOp::Sub => numbers[0] - numbers[1],
                ArithOp::Div | ArithOp::Mod if numbers[1] == 0.0 => return Value::Null,
                ArithOp::Div => numbers[0] / numbers[1],
                ArithOp::Mod => numbers[0] % numbers[1],
            };
            number(result)
        }

        Expr::Fractional(args) => {
            let values: Vec<Value> = args.iter().map(|arg| eval(arg, scope)).collect();
            ops::fractional(&values, scope)
                .map(Value::String)
                .unwrap_or(Value::Null)
        }
        Expr::StartsWith(args) => {
            let values: Vec<Value> = args.iter().map(|arg| eval(arg, scope)).collect();
            ops::starts_with(&values).map(Value::Bool).unwrap_or(Value::Null)
        }
        Expr::EndsWith(args) => {
            let values: Vec<Value> = args.iter().map(|arg| eval(arg, scope)).collect();
            ops::ends_with(&values).map(Value::Bool).unwrap_or(Value::Null)
        }
        Expr::SemVer(args) => {
            let values: Vec<Value> = args.iter().map(|arg| eval(arg, scope)).collect();
            ops::sem_ver(&values).map(Value::Bool).unwrap_or(Value::Null)
        }
    }
}

/// JSON-Logic truthiness: `false`, `null`, `0`, `""` and `[]` are falsy.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

/// Loose equality with JS-style numeric coercion between numbers, numeric
/// strings and booleans. Arrays and objects compare structurally.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => a == b,
        _ => match (to_number(a), to_number(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

/// Strict equality: same JSON type (all numbers count as one type) and equal
/// value.
fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => {
            std::mem::discriminant(a) == std::mem::discriminant(b) && a == b
        }
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Option<bool> {
    let ordering = match (a, b) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => to_number(a)?.partial_cmp(&to_number(b)?)?,
    };
    Some(match op {
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Ge => ordering.is_ge(),
    })
}

/// Numeric coercion. `None` for null, arrays, objects and non-numeric
/// strings; misconfigured arithmetic then evaluates to `Null`.
fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        // Composite values rarely appear in cat; JSON is the least surprising
        // representation.
        other => other.to_string(),
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn clamp_index(index: i64, len: usize) -> usize {
    if index < 0 {
        len.saturating_sub(index.unsigned_abs() as usize)
    } else {
        (index as usize).min(len)
    }
}

/// Resolve a `var` path against the scope. Exact top-level keys win over
/// dot-path traversal; the empty path returns the whole scope.
fn lookup(path: &Value, scope: &Map<String, Value>) -> Option<Value> {
    let path = match path {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    if path.is_empty() {
        return Some(Value::Object(scope.clone()));
    }
    if let Some(value) = scope.get(&path) {
        return some_defined(value.clone());
    }

    let mut segments = path.split('.');
    let mut current = scope.get(segments.next()?)?.clone();
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?.clone(),
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?.clone()
            }
            _ => return None,
        };
    }
    some_defined(current)
}

fn some_defined(value: Value) -> Option<Value> {
    // An explicit null attribute behaves like an absent one, so `var`
    // defaults apply.
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}

fn missing_keys(args: &[Expr], scope: &Map<String, Value>) -> Vec<Value> {
    let values: Vec<Value> = args.iter().map(|arg| eval(arg, scope)).collect();
    // {"missing": [["a", "b"]]} and {"missing": ["a", "b"]} are equivalent.
    let keys = match values.as_slice() {
        [Value::Array(keys)] => keys.clone(),
        _ => values,
    };
    keys.into_iter()
        .filter(|key| lookup(key, scope).is_none())
        .collect()
}
