//! Property tests for placeholder normalization.

use apiary::adapters::sqlite::placeholders::convert_placeholders;
use proptest::prelude::*;
use serde_json::{json, Value};

proptest! {
    /// `$1..$N` in order converts to the same number of `?` and echoes
    /// the parameters verbatim.
    #[test]
    fn sequential_placeholders_round_trip(values in proptest::collection::vec(any::<i64>(), 1..8)) {
        let sql = (1..=values.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(" , ");
        let params: Vec<Value> = values.iter().map(|v| json!(v)).collect();

        let (converted, bound) = convert_placeholders(&sql, &params).unwrap();
        prop_assert_eq!(converted.matches('?').count(), values.len());
        prop_assert!(!converted.contains('$'));
        prop_assert_eq!(bound, params);
    }

    /// `= ANY($1)` expands to exactly as many `?` as the array has
    /// elements.
    #[test]
    fn any_expansion_matches_array_length(values in proptest::collection::vec(any::<i32>(), 0..10)) {
        let array: Vec<Value> = values.iter().map(|v| json!(v)).collect();
        let (converted, bound) =
            convert_placeholders("SELECT * FROM t WHERE id = ANY($1)", &[Value::Array(array.clone())])
                .unwrap();

        prop_assert_eq!(converted.matches('?').count(), values.len());
        prop_assert_eq!(bound.len(), values.len());
        if values.is_empty() {
            prop_assert!(converted.contains("IN (SELECT 1 WHERE 0)"));
        } else {
            prop_assert_eq!(bound, array);
        }
    }

    /// Text without placeholders or quotes passes through unchanged.
    #[test]
    fn plain_sql_is_untouched(sql in "[a-zA-Z0-9_ .,()=<>]*") {
        // The generator never emits '$' or quotes, so conversion is identity.
        prop_assume!(!sql.contains('$'));
        let (converted, bound) = convert_placeholders(&sql, &[]).unwrap();
        prop_assert_eq!(converted, sql);
        prop_assert!(bound.is_empty());
    }
}
