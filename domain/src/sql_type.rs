use serde::{Deserialize, Serialize};

///
/// The destination SQL Server type chosen for a single column, plus whether the inferencer
/// is confident in that choice (see the `ingest` crate for how this is derived).
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlColumnType {
    Bit { reliable: bool },
    Int { reliable: bool },
    BigInt { reliable: bool },
    Decimal { precision: u8, scale: u8, reliable: bool },
    Date { reliable: bool },
    DateTime { reliable: bool },
    NVarChar { max: bool, reliable: bool }, // max == true -> nvarchar(max), else nvarchar(255).
}

impl SqlColumnType {
    ///
    /// The column ordering used to break reliability ties during inference - most specific
    /// first, nvarchar as the universal fallback.
    ///
    pub fn priority(&self) -> u8 {
        match self {
            SqlColumnType::Bit { .. }      => 1,
            SqlColumnType::Int { .. }      => 2,
            SqlColumnType::BigInt { .. }   => 3,
            SqlColumnType::Decimal { .. }  => 4,
            SqlColumnType::Date { .. }     => 5,
            SqlColumnType::DateTime { .. } => 6,
            SqlColumnType::NVarChar { .. } => 99,
        }
    }

    pub fn reliable(&self) -> bool {
        match self {
            SqlColumnType::Bit { reliable }
            | SqlColumnType::Int { reliable }
            | SqlColumnType::BigInt { reliable }
            | SqlColumnType::Decimal { reliable, .. }
            | SqlColumnType::Date { reliable }
            | SqlColumnType::DateTime { reliable }
            | SqlColumnType::NVarChar { reliable, .. } => *reliable,
        }
    }

    ///
    /// The SQL Server column definition fragment, e.g. "decimal(12,3)" or "nvarchar(max)".
    /// Every destination data-table column is nullable (spec'd, no exceptions).
    ///
    pub fn to_sql_definition(&self) -> String {
        let type_sql = match self {
            SqlColumnType::Bit { .. }      => "bit".to_string(),
            SqlColumnType::Int { .. }      => "int".to_string(),
            SqlColumnType::BigInt { .. }   => "bigint".to_string(),
            SqlColumnType::Decimal { precision, scale, .. } => format!("decimal({},{})", precision, scale),
            SqlColumnType::Date { .. }     => "date".to_string(),
            SqlColumnType::DateTime { .. } => "datetime".to_string(),
            SqlColumnType::NVarChar { max: true, .. }  => "nvarchar(max)".to_string(),
            SqlColumnType::NVarChar { max: false, .. } => "nvarchar(255)".to_string(),
        };
        format!("{} NULL", type_sql)
    }

    pub fn nvarchar_255(reliable: bool) -> Self {
        SqlColumnType::NVarChar { max: false, reliable }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_definition() {
        let dt = SqlColumnType::Decimal { precision: 12, scale: 3, reliable: true };
        assert_eq!("decimal(12,3) NULL", dt.to_sql_definition());
    }

    #[test]
    fn test_nvarchar_max_definition() {
        let dt = SqlColumnType::NVarChar { max: true, reliable: false };
        assert_eq!("nvarchar(max) NULL", dt.to_sql_definition());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(SqlColumnType::Bit { reliable: true }.priority() < SqlColumnType::Int { reliable: true }.priority());
        assert!(SqlColumnType::Date { reliable: true }.priority() < SqlColumnType::NVarChar { max: false, reliable: true }.priority());
    }
}
