//! Column types declared by field mappings and rendered into DDL.

use std::fmt;

/// The storage type of a mapped column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal { precision: u8, scale: u8 },
    Boolean,
    Char(u32),
    VarChar(u32),
    Text,
    Blob,
    Date,
    Timestamp,
    Uuid,
    Json,
    /// Element type of a collection mapping stored inline.
    Array(Box<SqlType>),
    /// Passed through to DDL unchanged.
    Custom(&'static str),
}

impl SqlType {
    /// The type as written in a column definition.
    pub fn sql_name(&self) -> String {
        self.to_string()
    }

    /// Whether values of this type can be produced by the database as keys.
    pub const fn can_generate(&self) -> bool {
        matches!(self, SqlType::SmallInt | SqlType::Integer | SqlType::BigInt)
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlType::SmallInt => f.write_str("SMALLINT"),
            SqlType::Integer => f.write_str("INTEGER"),
            SqlType::BigInt => f.write_str("BIGINT"),
            SqlType::Real => f.write_str("REAL"),
            SqlType::Double => f.write_str("DOUBLE PRECISION"),
            SqlType::Decimal { precision, scale } => write!(f, "DECIMAL({precision}, {scale})"),
            SqlType::Boolean => f.write_str("BOOLEAN"),
            SqlType::Char(n) => write!(f, "CHAR({n})"),
            SqlType::VarChar(n) => write!(f, "VARCHAR({n})"),
            SqlType::Text => f.write_str("TEXT"),
            SqlType::Blob => f.write_str("BLOB"),
            SqlType::Date => f.write_str("DATE"),
            SqlType::Timestamp => f.write_str("TIMESTAMP"),
            SqlType::Uuid => f.write_str("UUID"),
            SqlType::Json => f.write_str("JSON"),
            SqlType::Array(inner) => write!(f, "{inner}[]"),
            SqlType::Custom(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_type_names() {
        assert_eq!(SqlType::BigInt.sql_name(), "BIGINT");
        assert_eq!(SqlType::VarChar(40).sql_name(), "VARCHAR(40)");
        assert_eq!(
            SqlType::Decimal { precision: 9, scale: 2 }.to_string(),
            "DECIMAL(9, 2)"
        );
        assert_eq!(SqlType::Array(Box::new(SqlType::Text)).sql_name(), "TEXT[]");
        assert_eq!(SqlType::Custom("CITEXT").sql_name(), "CITEXT");
    }

    #[test]
    fn only_integers_are_generated() {
        assert!(SqlType::BigInt.can_generate());
        assert!(!SqlType::VarChar(10).can_generate());
        assert!(!SqlType::Decimal { precision: 9, scale: 0 }.can_generate());
    }
}
