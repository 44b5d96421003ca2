//! flagd custom operators. All helpers return `Option`: a misconfigured
//! operator is a non-match, never a panic or an evaluation failure.
use std::io::Cursor;

use murmur3::murmur3_32;
use semver::Version;
use serde_json::{Map, Value};

/// Deterministic percentage bucketing.
///
/// The first argument may be an expression that evaluated to a string, in
/// which case it is the bucketing key; otherwise the key is the flag key
/// concatenated with the targeting key. The remaining arguments are
/// `[variant]` or `[variant, weight]` arrays (weight defaults to 1). The
/// bucket is `abs(murmur3_32(key) as i32) / (2^31 - 1) * 100`, and the first
/// variant whose cumulative share of 100 exceeds it wins.
pub(crate) fn fractional(args: &[Value], scope: &Map<String, Value>) -> Option<String> {
    let (seed, buckets) = match args.first() {
        Some(Value::String(seed)) => (Some(seed.clone()), &args[1..]),
        _ => (None, args),
    };

    let key = match seed {
        Some(seed) => seed,
        None => {
            let flag_key = scope
                .get("$flagd")
                .and_then(|flagd| flagd.get("flagKey"))
                .and_then(Value::as_str)?;
            let targeting_key = scope.get("targetingKey").and_then(Value::as_str)?;
            format!("{flag_key}{targeting_key}")
        }
    };

    let buckets: Vec<(&str, f64)> = buckets
        .iter()
        .map(|bucket| match bucket {
            Value::Array(pair) => {
                let variant = pair.first()?.as_str()?;
                let weight = match pair.get(1) {
                    Some(weight) => weight.as_f64()?,
                    None => 1.0,
                };
                Some((variant, weight))
            }
            _ => None,
        })
        .collect::<Option<_>>()?;

    let total_weight: f64 = buckets.iter().map(|(_, weight)| weight).sum();
    if buckets.is_empty() || total_weight <= 0.0 {
        return None;
    }

    let bucket = bucket_value(&key);
    let mut upper_bound = 0.0;
    for (variant, weight) in buckets {
        upper_bound += weight * 100.0 / total_weight;
        if bucket < upper_bound {
            return Some(variant.to_owned());
        }
    }
    None
}

/// Map a bucketing key onto [0, 100).
fn bucket_value(key: &str) -> f64 {
    let hash = murmur3_32(&mut Cursor::new(key.as_bytes()), 0).unwrap_or(0);
    let ratio = (hash as i32).unsigned_abs() as f64 / i32::MAX as f64;
    ratio * 100.0
}

pub(crate) fn starts_with(args: &[Value]) -> Option<bool> {
    let (a, b) = two_strings(args)?;
    Some(a.starts_with(b))
}

pub(crate) fn ends_with(args: &[Value]) -> Option<bool> {
    let (a, b) = two_strings(args)?;
    Some(a.ends_with(b))
}

fn two_strings(args: &[Value]) -> Option<(&str, &str)> {
    match args {
        [Value::String(a), Value::String(b)] => Some((a, b)),
        _ => None,
    }
}

/// Semantic-version comparison: `[v1, op, v2]` with op one of `=`, `!=`,
/// `<`, `<=`, `>`, `>=`, `^` (same major) or `~` (same major and minor).
pub(crate) fn sem_ver(args: &[Value]) -> Option<bool> {
    let [v1, op, v2] = args else {
        return None;
    };
    let v1 = parse_version(v1.as_str()?)?;
    let v2 = parse_version(v2.as_str()?)?;

    Some(match op.as_str()? {
        "=" => v1 == v2,
        "!=" => v1 != v2,
        "<" => v1 < v2,
        "<=" => v1 <= v2,
        ">" => v1 > v2,
        ">=" => v1 >= v2,
        "^" => v1.major == v2.major,
        "~" => v1.major == v2.major && v1.minor == v2.minor,
        _ => return None,
    })
}

/// Parse a version, tolerating one leading `v`/`V`.
fn parse_version(s: &str) -> Option<Version> {
    let s = s.strip_prefix(['v', 'V']).unwrap_or(s);
    Version::parse(s).ok()
}
