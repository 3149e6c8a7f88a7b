use serde_json::Value;

// Rough per-allocation costs. These stand in for what an allocator-level
// accounting hook would report: every value carries its enum footprint, and
// containers and strings add their heap blocks.
const VALUE_COST: usize = std::mem::size_of::<Value>();
const STRING_HEADER: usize = std::mem::size_of::<String>();
const MAP_ENTRY_HEADER: usize = 48;
const CONTAINER_HEADER: usize = 32;

/// Estimate the heap footprint of a JSON tree in bytes.
///
/// The object store sums this over every cached object and evicts until the
/// total fits under its configured ceiling, so the estimate only has to be
/// consistent, not exact. Scalars (numbers, booleans, null) are covered by
/// the enum footprint alone.
pub fn estimate_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => VALUE_COST,
        Value::String(s) => VALUE_COST + STRING_HEADER + s.len(),
        Value::Array(items) => {
            CONTAINER_HEADER + items.iter().map(estimate_size).sum::<usize>()
        }
        Value::Object(map) => {
            CONTAINER_HEADER
                + map
                    .iter()
                    .map(|(k, v)| MAP_ENTRY_HEADER + k.len() + estimate_size(v))
                    .sum::<usize>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_cost_the_enum_footprint() {
        assert_eq!(estimate_size(&json!(null)), VALUE_COST);
        assert_eq!(estimate_size(&json!(true)), VALUE_COST);
        assert_eq!(estimate_size(&json!(123456)), VALUE_COST);
    }

    #[test]
    fn strings_scale_with_length() {
        let short = estimate_size(&json!("ab"));
        let long = estimate_size(&json!("abcdefghijklmnop"));
        assert_eq!(long - short, 14);
    }

    #[test]
    fn containers_grow_with_members() {
        let empty = estimate_size(&json!({}));
        let one = estimate_size(&json!({"k": 1}));
        let two = estimate_size(&json!({"k": 1, "l": 2}));
        assert!(empty < one && one < two);
        assert_eq!(two - one, MAP_ENTRY_HEADER + 1 + VALUE_COST);
    }

    #[test]
    fn nested_trees_sum_their_parts() {
        let inner = json!({"a": "xyz"});
        let outer = json!({"wrap": {"a": "xyz"}});
        let expected =
            CONTAINER_HEADER + MAP_ENTRY_HEADER + "wrap".len() + estimate_size(&inner);
        assert_eq!(estimate_size(&outer), expected);
    }
}
