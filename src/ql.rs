//! Measurement-name scanning for write lines and queries, grounded in
//! `original_source/backend/cluster.go`'s `ScanKey` and
//! `original_source/backend/influxql.go`'s `GetMeasurementsFromInfluxQL`.
//!
//! This is a pragmatic scanner, not a full InfluxQL grammar: building and
//! vendoring a pure-Rust InfluxQL parser is out of proportion to what this
//! component needs to do. It recognizes the handful of statement shapes the
//! original supports.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::RouterError;

/// Extracts the measurement name from the start of an ingest-protocol line.
///
/// `\` escapes the next byte; an unescaped `,` or space terminates the
/// measurement. Reaching the end of the line before a delimiter is an
/// error.
pub fn scan_key(line: &[u8]) -> Result<String, RouterError> {
    let mut key = Vec::with_capacity(line.len().min(64));
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b'\\' => {
                i += 1;
                if i >= line.len() {
                    return Err(RouterError::IllegalQl);
                }
                key.push(line[i]);
            },
            b' ' | b',' => return Ok(String::from_utf8_lossy(&key).into_owned()),
            c => key.push(c),
        }
        i += 1;
    }
    Err(RouterError::IllegalQl)
}

// One pattern per statement shape the original's `influxql.ParseStatement`
// dispatch handled: SELECT/SHOW .../DELETE, each ending in a `FROM <list>`
// clause. The source list runs until the next clause keyword or end of
// string, and may hold several comma-separated, possibly dotted or quoted,
// names.
static FROM_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bfrom\s+((?:"(?:[^"\\]|\\.)*"|[^,\s()])+(?:\s*,\s*(?:"(?:[^"\\]|\\.)*"|[^,\s()])+)*)"#)
        .unwrap()
});

static SELECT_OR_SHOW_OR_DELETE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(select|show\s+\w+(\s+\w+)*|delete(\s+series)?)\b").unwrap());

/// Unquotes a measurement name and, for database-qualified forms
/// (`db.rp.measurement` / `db..measurement`), returns only the last dotted
/// segment — what the original's AST-based extraction returns as
/// `measurement.Name`.
fn unquote_and_last_segment(raw: &str) -> String {
    let raw = raw.trim();
    let unquoted = if raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2 {
        raw[1..raw.len() - 1].replace("\\\"", "\"")
    } else {
        raw.to_string()
    };
    unquoted
        .split('.')
        .filter(|segment| !segment.is_empty())
        .last()
        .unwrap_or(&unquoted)
        .to_string()
}

/// Returns every measurement named in the `FROM` clause(s) of a recognized
/// statement (`SELECT`, `SHOW ... FROM`, `DELETE [SERIES] FROM`). `Err` for
/// anything else, matching the original's `ErrIllegalQL`.
pub fn extract_measurements(q: &str) -> Result<Vec<String>, RouterError> {
    if !SELECT_OR_SHOW_OR_DELETE.is_match(q) {
        return Err(RouterError::IllegalQl);
    }

    let mut names = Vec::new();
    for list in FROM_CLAUSE.captures_iter(q) {
        for name in list[1].split(',') {
            names.push(unquote_and_last_segment(name));
        }
    }

    if names.is_empty() {
        return Err(RouterError::IllegalQl);
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_key_splits_on_first_unescaped_comma_or_space() {
        assert_eq!(scan_key(b"cpu,host=a v=1").unwrap(), "cpu");
        assert_eq!(scan_key(b"cpu v=1").unwrap(), "cpu");
    }

    #[test]
    fn scan_key_unescapes_backslash_sequences() {
        assert_eq!(scan_key(b"cpu\\,load,host=a v=1").unwrap(), "cpu,load");
        assert_eq!(scan_key(b"cpu\\ load v=1").unwrap(), "cpu load");
    }

    #[test]
    fn scan_key_round_trip_for_escaped_measurement() {
        let measurement = "weird,name with\\stuff";
        let mut escaped = String::new();
        for c in measurement.chars() {
            if c == ',' || c == ' ' {
                escaped.push('\\');
            }
            escaped.push(c);
        }
        let line = format!("{escaped},host=a v=1 123");
        assert_eq!(scan_key(line.as_bytes()).unwrap(), measurement);
    }

    #[test]
    fn scan_key_errors_without_delimiter() {
        assert!(scan_key(b"nodata").is_err());
    }

    #[test]
    fn extract_measurements_select_from() {
        let got = extract_measurements("SELECT * FROM cpu WHERE host='a'").unwrap();
        assert_eq!(got, vec!["cpu".to_string()]);
    }

    #[test]
    fn extract_measurements_show_tag_values() {
        let got = extract_measurements("SHOW TAG VALUES FROM cpu WITH KEY = \"host\"").unwrap();
        assert_eq!(got, vec!["cpu".to_string()]);
    }

    #[test]
    fn extract_measurements_delete_from() {
        let got = extract_measurements("DELETE FROM cpu WHERE time < now()").unwrap();
        assert_eq!(got, vec!["cpu".to_string()]);
    }

    #[test]
    fn extract_measurements_strips_database_qualifier() {
        let got = extract_measurements("SELECT * FROM mydb.autogen.cpu").unwrap();
        assert_eq!(got, vec!["cpu".to_string()]);
    }

    #[test]
    fn extract_measurements_rejects_non_from_statements() {
        assert!(extract_measurements("GRANT ALL TO user").is_err());
    }

    #[test]
    fn extract_measurements_zero_or_multiple_are_both_representable() {
        assert!(extract_measurements("SHOW DATABASES").is_err());
        let multi = extract_measurements("SELECT * FROM cpu, mem").unwrap();
        assert_eq!(multi.len(), 2);
    }
}
