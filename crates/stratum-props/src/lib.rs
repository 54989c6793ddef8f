//! Kind and property knowledge
//!
//! Decides which aggregate each column gets when a view is grouped without
//! explicit aggregates, and which property identifies a bare value of a kind.

use stratum_ir::{AggFunc, Aggregate, Column, ColumnType};

const EARLIEST: &[&str] = &["first_observed", "start", "created"];
const LATEST: &[&str] = &["last_observed", "end", "modified"];
const OPAQUE: &[&str] = &["x_stix", "payload_bin"];
const ADDITIVE_SUFFIXES: &[&str] = &["_count", "_bytes", "_packets"];

/// Aggregate for one column of `kind`, or `None` when the column has no
/// meaningful aggregate and must be left out of grouped output.
///
/// The result always keeps the column name as its alias.
pub fn aggregate_for(kind: &str, column: &str, declared_type: ColumnType) -> Option<Aggregate> {
    let func = aggregate_func(kind, column, declared_type)?;
    Some(Aggregate::keep_name(func, column))
}

fn aggregate_func(kind: &str, column: &str, declared_type: ColumnType) -> Option<AggFunc> {
    if column == "type" {
        return Some(AggFunc::Min);
    }
    if column == "id" || declared_type == ColumnType::Key {
        return None;
    }
    if EARLIEST.contains(&column) {
        return Some(AggFunc::Min);
    }
    if LATEST.contains(&column) {
        return Some(AggFunc::Max);
    }
    if column == "number_observed" {
        return Some(AggFunc::Sum);
    }

    match declared_type {
        t if t.is_numeric() => {
            if kind == "network-traffic" && column.ends_with("_port") {
                Some(AggFunc::CountDistinct)
            } else if ADDITIVE_SUFFIXES.iter().any(|s| column.ends_with(s)) {
                Some(AggFunc::Sum)
            } else {
                Some(AggFunc::Avg)
            }
        }
        ColumnType::Boolean => Some(AggFunc::Max),
        _ if OPAQUE.contains(&column) => None,
        _ => Some(AggFunc::CountDistinct),
    }
}

/// Aggregates for every column of `schema` that is not a group column
pub fn auto_aggregates(kind: &str, schema: &[Column], group_columns: &[String]) -> Vec<Aggregate> {
    schema
        .iter()
        .filter(|c| !group_columns.iter().any(|g| g == &c.name))
        .filter_map(|c| aggregate_for(kind, &c.name, c.column_type))
        .collect()
}

/// Property holding the value of a bare string loaded as `kind`
pub fn primary_prop(kind: &str) -> Option<&'static str> {
    match kind {
        "ipv4-addr" | "ipv6-addr" | "domain-name" | "url" | "mac-addr" | "email-addr"
        | "mutex" => Some("value"),
        "file" | "process" => Some("name"),
        "user-account" => Some("user_id"),
        "x509-certificate" => Some("serial_number"),
        "windows-registry-key" => Some("key"),
        "autonomous-system" => Some("number"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(kind: &str, column: &str, t: ColumnType) -> Option<AggFunc> {
        aggregate_for(kind, column, t).map(|a| a.func)
    }

    #[test]
    fn test_bookkeeping_columns() {
        assert_eq!(func("host", "type", ColumnType::Text), Some(AggFunc::Min));
        assert_eq!(func("host", "id", ColumnType::Key), None);
        assert_eq!(func("host", "first_observed", ColumnType::Text), Some(AggFunc::Min));
        assert_eq!(func("host", "last_observed", ColumnType::Text), Some(AggFunc::Max));
        assert_eq!(func("host", "number_observed", ColumnType::Integer), Some(AggFunc::Sum));
    }

    #[test]
    fn test_numeric_columns() {
        assert_eq!(
            func("network-traffic", "dst_port", ColumnType::Integer),
            Some(AggFunc::CountDistinct)
        );
        assert_eq!(func("x-service", "dst_port", ColumnType::Integer), Some(AggFunc::Avg));
        assert_eq!(
            func("network-traffic", "src_byte_count", ColumnType::Integer),
            Some(AggFunc::Sum)
        );
        assert_eq!(
            func("network-traffic", "dst_packets", ColumnType::Integer),
            Some(AggFunc::Sum)
        );
        assert_eq!(func("process", "pid", ColumnType::Integer), Some(AggFunc::Avg));
        assert_eq!(func("x-host", "load", ColumnType::Real), Some(AggFunc::Avg));
    }

    #[test]
    fn test_text_and_boolean_columns() {
        assert_eq!(func("process", "name", ColumnType::Text), Some(AggFunc::CountDistinct));
        assert_eq!(func("x-host", "online", ColumnType::Boolean), Some(AggFunc::Max));
        assert_eq!(func("artifact", "payload_bin", ColumnType::Text), None);
        assert_eq!(func("x-oca-event", "x_stix", ColumnType::Text), None);
    }

    #[test]
    fn test_alias_keeps_column_name() {
        let agg = aggregate_for("process", "name", ColumnType::Text).unwrap();
        assert_eq!(agg.column, "name");
        assert_eq!(agg.alias, "name");
    }

    #[test]
    fn test_auto_aggregates_excludes_group_columns() {
        let schema = vec![
            Column::new("id", ColumnType::Key),
            Column::new("type", ColumnType::Text),
            Column::new("name", ColumnType::Text),
            Column::new("pid", ColumnType::Integer),
            Column::new("payload_bin", ColumnType::Text),
        ];
        let aggs = auto_aggregates("process", &schema, &["name".to_string()]);
        let names: Vec<&str> = aggs.iter().map(|a| a.alias.as_str()).collect();
        assert_eq!(names, vec!["type", "pid"]);
    }

    #[test]
    fn test_primary_prop() {
        assert_eq!(primary_prop("ipv4-addr"), Some("value"));
        assert_eq!(primary_prop("file"), Some("name"));
        assert_eq!(primary_prop("user-account"), Some("user_id"));
        assert_eq!(primary_prop("x-custom"), None);
    }
}
