use crate::error::StoreError;

/// Read a column, mapping decode failures to `CorruptRow`.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get(row, idx, table, column)
}

/// Decode a JSON text column into `T`.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Optional JSON text column.
pub fn parse_json_opt<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    raw.map(|s| parse_json(&s, table, column)).transpose()
}

pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::SessionStatus;

    #[test]
    fn parse_enum_success() {
        let status: SessionStatus = parse_enum("expired", "sessions", "status").unwrap();
        assert_eq!(status, SessionStatus::Expired);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<SessionStatus, _> = parse_enum("paused", "sessions", "status");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "sessions", column: "status", .. })
        ));
    }

    #[test]
    fn parse_json_typed() {
        let plugins: Vec<String> = parse_json(r#"["notes","calendar"]"#, "sessions", "plugins").unwrap();
        assert_eq!(plugins, vec!["notes", "calendar"]);

        let bad: Result<Vec<String>, _> = parse_json("{oops", "sessions", "plugins");
        assert!(matches!(bad, Err(StoreError::CorruptRow { column: "plugins", .. })));
    }

    #[test]
    fn parse_json_opt_passes_none() {
        let v: Option<serde_json::Value> = parse_json_opt(None, "messages", "tool_input").unwrap();
        assert!(v.is_none());
    }
}
