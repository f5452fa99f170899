//! Change events and stream positions.
//!
//! These are the values that flow from the stream reader through the
//! ordering buffer to the apply engine. A [`ChangeEvent`] is immutable once
//! the reader produces it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Log sequence numbers
// =============================================================================

/// A position in the source's write-ahead log.
///
/// Displays in PostgreSQL's `XXXXXXXX/XXXXXXXX` form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The start of the log. Replication from here means "from the slot's
    /// confirmed position".
    pub const ZERO: Lsn = Lsn(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

/// Error parsing an LSN string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid LSN {0:?}: expected XXXXXXXX/XXXXXXXX")]
pub struct ParseLsnError(String);

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.split_once('/').ok_or_else(|| ParseLsnError(s.to_string()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| ParseLsnError(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| ParseLsnError(s.to_string()))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

// =============================================================================
// Rows
// =============================================================================

/// Fully-qualified source table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub name: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.name`; a bare name lands in `public`.
    pub fn parse(qualified: &str) -> Self {
        match qualified.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new("public", qualified),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A single column value in text representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ColumnValue {
    Null,
    Text(String),
    /// TOASTed value the source did not resend because it did not change.
    Unchanged,
}

impl ColumnValue {
    pub fn text(v: impl Into<String>) -> Self {
        ColumnValue::Text(v.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Column name to value, in column order of the relation.
pub type RowImage = BTreeMap<String, ColumnValue>;

/// Type OID of `json`.
pub const JSON_OID: u32 = 114;
/// Type OID of `jsonb`.
pub const JSONB_OID: u32 = 3802;

// =============================================================================
// Events
// =============================================================================

/// Row-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => write!(f, "insert"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// One row change decoded from the replication stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub transaction_id: u32,
    /// Position of the change record itself.
    pub lsn: Lsn,
    pub table: TableId,
    /// Replica identity columns, from the relation's key flags.
    pub key_columns: Vec<String>,
    pub operation: Operation,
    /// Old key or full old row, when the source sent one.
    pub before_image: Option<RowImage>,
    /// New row for inserts and updates.
    pub after_image: Option<RowImage>,
    pub commit_timestamp: DateTime<Utc>,
    /// Source type OID per column, from the relation message.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub column_types: BTreeMap<String, u32>,
}

impl ChangeEvent {
    /// Whether the column's text value is a JSON document.
    pub fn is_json_column(&self, column: &str) -> bool {
        matches!(
            self.column_types.get(column),
            Some(&JSON_OID) | Some(&JSONB_OID)
        )
    }
}

/// End of a transaction in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMarker {
    pub transaction_id: u32,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub commit_timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_display() {
        assert_eq!(Lsn(0).to_string(), "0/0");
        assert_eq!(Lsn(0x16_B374_D848).to_string(), "16/B374D848");
    }

    #[test]
    fn test_lsn_parse() {
        assert_eq!("16/B374D848".parse::<Lsn>().unwrap(), Lsn(0x16_B374_D848));
        assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn::ZERO);
        assert!("16B374D848".parse::<Lsn>().is_err());
        assert!("zz/1".parse::<Lsn>().is_err());
        assert!("1/".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_lsn_display_parse_agree() {
        let lsn = Lsn(0xFFFF_FFFF_0000_0001);
        assert_eq!(lsn.to_string().parse::<Lsn>().unwrap(), lsn);
    }

    #[test]
    fn test_lsn_ordering() {
        assert!(Lsn(1) < Lsn(2));
        assert!(Lsn(1 << 32) > Lsn(0xFFFF_FFFF));
    }

    #[test]
    fn test_table_id_parse() {
        assert_eq!(TableId::parse("sales.orders"), TableId::new("sales", "orders"));
        assert_eq!(TableId::parse("orders"), TableId::new("public", "orders"));
        assert_eq!(TableId::new("a", "b").to_string(), "a.b");
    }

    #[test]
    fn test_column_value_json() {
        let json = serde_json::to_string(&ColumnValue::text("x")).unwrap();
        assert_eq!(json, r#"{"kind":"text","value":"x"}"#);
        let back: ColumnValue = serde_json::from_str(r#"{"kind":"null"}"#).unwrap();
        assert_eq!(back, ColumnValue::Null);
    }
}
