//! Parameter-placeholder normalization.
//!
//! Upstream query text uses PG-style `$N` placeholders; the embedded
//! engine wants `?`. Conversion also expands `= ANY($N)` over an array
//! parameter into an `IN (?, ?, …)` list, or `IN (SELECT 1 WHERE 0)` when
//! the array is empty so the predicate is well-formed and matches nothing.
//! Parameters are re-emitted in occurrence order, so a `$N` referenced
//! twice binds its value twice.

use serde_json::Value;

use crate::domain::errors::{DomainError, DomainResult};

/// Convert `$N` placeholders to `?` and expand `= ANY($N)` array
/// predicates. Returns the rewritten SQL and the bind list in occurrence
/// order.
pub fn convert_placeholders(sql: &str, params: &[Value]) -> DomainResult<(String, Vec<Value>)> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut bound: Vec<Value> = Vec::with_capacity(params.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        // String literals pass through untouched, including '' escapes.
        if c == '\'' {
            out.push(c);
            i += 1;
            while i < chars.len() {
                out.push(chars[i]);
                if chars[i] == '\'' {
                    if i + 1 < chars.len() && chars[i + 1] == '\'' {
                        out.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            continue;
        }

        if c == '=' {
            if let Some((consumed, index)) = parse_any_predicate(&chars[i..]) {
                let array = param_at(params, index)?;
                let Value::Array(items) = array else {
                    return Err(DomainError::Validation(format!(
                        "= ANY(${index}) requires an array parameter"
                    )));
                };
                if items.is_empty() {
                    out.push_str("IN (SELECT 1 WHERE 0)");
                } else {
                    out.push_str("IN (");
                    for (n, item) in items.iter().enumerate() {
                        if n > 0 {
                            out.push_str(", ");
                        }
                        out.push('?');
                        bound.push(item.clone());
                    }
                    out.push(')');
                }
                i += consumed;
                continue;
            }
        }

        if c == '$' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit() {
            let (consumed, index) = parse_index(&chars[i..]);
            bound.push(param_at(params, index)?.clone());
            out.push('?');
            i += consumed;
            continue;
        }

        out.push(c);
        i += 1;
    }

    Ok((out, bound))
}

fn param_at(params: &[Value], index: usize) -> DomainResult<&Value> {
    if index == 0 || index > params.len() {
        return Err(DomainError::Validation(format!(
            "placeholder ${index} out of range for {} parameters",
            params.len()
        )));
    }
    Ok(&params[index - 1])
}

/// Parse `$N` starting at a `$`. Returns (chars consumed, N).
fn parse_index(chars: &[char]) -> (usize, usize) {
    let mut i = 1;
    let mut n = 0usize;
    while i < chars.len() && chars[i].is_ascii_digit() {
        n = n * 10 + chars[i].to_digit(10).unwrap() as usize;
        i += 1;
    }
    (i, n)
}

/// Match `= ANY($N)` (case-insensitive, tolerant of whitespace) starting
/// at the `=`. Returns (chars consumed, N) on a full match.
fn parse_any_predicate(chars: &[char]) -> Option<(usize, usize)> {
    let mut i = 1;
    i += count_ws(&chars[i..]);
    for expected in ['a', 'n', 'y'] {
        if chars.get(i)?.to_ascii_lowercase() != expected {
            return None;
        }
        i += 1;
    }
    i += count_ws(&chars[i..]);
    if *chars.get(i)? != '(' {
        return None;
    }
    i += 1;
    i += count_ws(&chars[i..]);
    if *chars.get(i)? != '$' || !chars.get(i + 1)?.is_ascii_digit() {
        return None;
    }
    let (consumed, n) = parse_index(&chars[i..]);
    i += consumed;
    i += count_ws(&chars[i..]);
    if *chars.get(i)? != ')' {
        return None;
    }
    Some((i + 1, n))
}

fn count_ws(chars: &[char]) -> usize {
    chars.iter().take_while(|c| c.is_whitespace()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_positional_placeholders() {
        let (sql, params) = convert_placeholders(
            "SELECT * FROM t WHERE a = $1 AND b = $2",
            &[json!("x"), json!(2)],
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = ? AND b = ?");
        assert_eq!(params, vec![json!("x"), json!(2)]);
    }

    #[test]
    fn repeated_placeholder_binds_twice() {
        let (sql, params) =
            convert_placeholders("SELECT $1, $1", &[json!("dup")]).unwrap();
        assert_eq!(sql, "SELECT ?, ?");
        assert_eq!(params, vec![json!("dup"), json!("dup")]);
    }

    #[test]
    fn expands_any_over_array() {
        let (sql, params) = convert_placeholders(
            "SELECT * FROM t WHERE id = ANY($1)",
            &[json!(["a", "b", "c"])],
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE id IN (?, ?, ?)");
        assert_eq!(params, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn empty_any_matches_nothing() {
        let (sql, params) =
            convert_placeholders("SELECT * FROM t WHERE id = ANY($1)", &[json!([])]).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE id IN (SELECT 1 WHERE 0)");
        assert!(params.is_empty());
    }

    #[test]
    fn any_requires_array_parameter() {
        let err =
            convert_placeholders("SELECT * FROM t WHERE id = ANY($1)", &[json!("scalar")])
                .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn placeholders_inside_string_literals_pass_through() {
        let (sql, params) =
            convert_placeholders("SELECT '$1' FROM t WHERE a = $1", &[json!(1)]).unwrap();
        assert_eq!(sql, "SELECT '$1' FROM t WHERE a = ?");
        assert_eq!(params, vec![json!(1)]);
    }

    #[test]
    fn out_of_range_placeholder_is_rejected() {
        let err = convert_placeholders("SELECT $3", &[json!(1)]).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn mixed_any_and_scalar_preserves_order() {
        let (sql, params) = convert_placeholders(
            "SELECT * FROM t WHERE a = $2 AND id = ANY($1) AND b = $3",
            &[json!([10, 20]), json!("first"), json!("last")],
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM t WHERE a = ? AND id IN (?, ?) AND b = ?"
        );
        assert_eq!(
            params,
            vec![json!("first"), json!(10), json!(20), json!("last")]
        );
    }
}
