//! Canonical column types.
//!
//! Each backend spells types differently (`int4` vs `INTEGER`,
//! `character varying(255)` vs `VARCHAR(255)`). Catalog output and declared
//! target types are both parsed into [`ColumnType`] so the diff compares
//! meaning rather than spelling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnType {
    /// 16-bit integer.
    SmallInt,
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInt,
    /// Auto-incrementing 32-bit integer.
    Serial,
    /// Auto-incrementing 64-bit integer.
    BigSerial,
    /// Single precision float.
    Real,
    /// Double precision float.
    Double,
    /// Fixed precision decimal.
    Numeric {
        /// Total digits, if bounded.
        precision: Option<u32>,
        /// Digits after the decimal point, if bounded.
        scale: Option<u32>,
    },
    /// Variable length string with optional limit.
    Varchar {
        /// Maximum length, `None` when unbounded.
        length: Option<u32>,
    },
    /// Fixed length, blank padded string.
    Char {
        /// Declared length.
        length: Option<u32>,
    },
    /// Unbounded text.
    Text,
    /// Boolean.
    Boolean,
    /// Calendar date.
    Date,
    /// Time of day.
    Time,
    /// Timestamp without time zone.
    Timestamp,
    /// Timestamp with time zone.
    TimestampTz,
    /// UUID.
    Uuid,
    /// JSON document.
    Json {
        /// Binary representation (`jsonb`).
        binary: bool,
    },
    /// Binary data.
    Blob,
    /// Any type the canonical model does not understand (lowercased).
    Other {
        /// Raw type name.
        name: String,
    },
}

/// Broad grouping used to detect cross-family changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeFamily {
    /// Integer types.
    Integer,
    /// Floating point types.
    Float,
    /// Exact decimal types.
    Numeric,
    /// Character types.
    String,
    /// Boolean.
    Boolean,
    /// Date and time types.
    Temporal,
    /// UUID.
    Uuid,
    /// JSON.
    Json,
    /// Binary.
    Binary,
    /// Unknown types; only identical types match.
    Other,
}

impl ColumnType {
    /// Parse a backend type string.
    pub fn parse(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
        let (base, args) = split_args(&collapsed);
        let first = args.first().copied();
        let second = args.get(1).copied();

        match base.as_str() {
            "smallint" | "int2" | "smallserial" => ColumnType::SmallInt,
            "integer" | "int" | "int4" | "mediumint" => ColumnType::Integer,
            "bigint" | "int8" => ColumnType::BigInt,
            "serial" | "serial4" => ColumnType::Serial,
            "bigserial" | "serial8" => ColumnType::BigSerial,
            "real" | "float4" => ColumnType::Real,
            "double precision" | "double" | "float8" | "float" => ColumnType::Double,
            "numeric" | "decimal" => ColumnType::Numeric {
                precision: first,
                scale: second.or(first.map(|_| 0)),
            },
            "character varying" | "varchar" | "nvarchar" | "varying character" => {
                ColumnType::Varchar { length: first }
            }
            "character" | "char" | "bpchar" | "nchar" => ColumnType::Char { length: first },
            "text" | "clob" | "string" => ColumnType::Text,
            "boolean" | "bool" => ColumnType::Boolean,
            "date" => ColumnType::Date,
            "time" | "time without time zone" => ColumnType::Time,
            "timestamp" | "timestamp without time zone" | "datetime" => ColumnType::Timestamp,
            "timestamptz" | "timestamp with time zone" => ColumnType::TimestampTz,
            "uuid" => ColumnType::Uuid,
            "json" => ColumnType::Json { binary: false },
            "jsonb" => ColumnType::Json { binary: true },
            "bytea" | "blob" => ColumnType::Blob,
            _ => ColumnType::Other { name: collapsed },
        }
    }

    /// The family this type belongs to.
    pub fn family(&self) -> TypeFamily {
        match self {
            ColumnType::SmallInt
            | ColumnType::Integer
            | ColumnType::BigInt
            | ColumnType::Serial
            | ColumnType::BigSerial => TypeFamily::Integer,
            ColumnType::Real | ColumnType::Double => TypeFamily::Float,
            ColumnType::Numeric { .. } => TypeFamily::Numeric,
            ColumnType::Varchar { .. } | ColumnType::Char { .. } | ColumnType::Text => {
                TypeFamily::String
            }
            ColumnType::Boolean => TypeFamily::Boolean,
            ColumnType::Date | ColumnType::Time | ColumnType::Timestamp | ColumnType::TimestampTz => {
                TypeFamily::Temporal
            }
            ColumnType::Uuid => TypeFamily::Uuid,
            ColumnType::Json { .. } => TypeFamily::Json,
            ColumnType::Blob => TypeFamily::Binary,
            ColumnType::Other { .. } => TypeFamily::Other,
        }
    }

    /// Width rank within the integer family.
    pub(crate) fn integer_rank(&self) -> Option<u8> {
        match self {
            ColumnType::SmallInt => Some(1),
            ColumnType::Integer | ColumnType::Serial => Some(2),
            ColumnType::BigInt | ColumnType::BigSerial => Some(3),
            _ => None,
        }
    }

    /// Decimal digits needed to hold any value of an integer type.
    pub(crate) fn integer_digits(&self) -> Option<u32> {
        self.integer_rank().map(|rank| match rank {
            1 => 5,
            2 => 10,
            _ => 19,
        })
    }

    /// Whether the column auto-increments.
    pub fn is_serial(&self) -> bool {
        matches!(self, ColumnType::Serial | ColumnType::BigSerial)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::SmallInt => write!(f, "SMALLINT"),
            ColumnType::Integer => write!(f, "INTEGER"),
            ColumnType::BigInt => write!(f, "BIGINT"),
            ColumnType::Serial => write!(f, "SERIAL"),
            ColumnType::BigSerial => write!(f, "BIGSERIAL"),
            ColumnType::Real => write!(f, "REAL"),
            ColumnType::Double => write!(f, "DOUBLE PRECISION"),
            ColumnType::Numeric {
                precision: Some(p),
                scale: Some(s),
            } => write!(f, "NUMERIC({}, {})", p, s),
            ColumnType::Numeric {
                precision: Some(p),
                scale: None,
            } => write!(f, "NUMERIC({})", p),
            ColumnType::Numeric { .. } => write!(f, "NUMERIC"),
            ColumnType::Varchar { length: Some(n) } => write!(f, "VARCHAR({})", n),
            ColumnType::Varchar { length: None } => write!(f, "VARCHAR"),
            ColumnType::Char { length: Some(n) } => write!(f, "CHAR({})", n),
            ColumnType::Char { length: None } => write!(f, "CHAR"),
            ColumnType::Text => write!(f, "TEXT"),
            ColumnType::Boolean => write!(f, "BOOLEAN"),
            ColumnType::Date => write!(f, "DATE"),
            ColumnType::Time => write!(f, "TIME"),
            ColumnType::Timestamp => write!(f, "TIMESTAMP"),
            ColumnType::TimestampTz => write!(f, "TIMESTAMPTZ"),
            ColumnType::Uuid => write!(f, "UUID"),
            ColumnType::Json { binary: true } => write!(f, "JSONB"),
            ColumnType::Json { binary: false } => write!(f, "JSON"),
            ColumnType::Blob => write!(f, "BLOB"),
            ColumnType::Other { name } => write!(f, "{}", name.to_ascii_uppercase()),
        }
    }
}

/// Split `varchar(255)` into (`varchar`, [255]).
///
/// Also handles the PostgreSQL spelling `timestamp(3) with time zone`, where
/// the modifier sits in the middle of the name.
fn split_args(raw: &str) -> (String, Vec<u32>) {
    let Some(open) = raw.find('(') else {
        return (raw.to_string(), Vec::new());
    };
    let Some(close_rel) = raw[open..].find(')') else {
        return (raw.to_string(), Vec::new());
    };
    let close = open + close_rel;
    let args = raw[open + 1..close]
        .split(',')
        .filter_map(|a| a.trim().parse::<u32>().ok())
        .collect();
    let base = format!("{}{}", raw[..open].trim_end(), raw[close + 1..].trim_end());
    let base = base.split_whitespace().collect::<Vec<_>>().join(" ");
    (base, args)
}

/// Normalise a column default expression for comparison.
///
/// Strips `::type` casts, outer parentheses and surrounding whitespace, so
/// PostgreSQL's `'active'::character varying` compares equal to `'active'`.
pub fn normalize_default(raw: &str) -> String {
    let mut current = raw.trim().to_string();
    loop {
        let stripped = strip_outer_parens(&strip_trailing_cast(&current));
        if stripped == current {
            break;
        }
        current = stripped;
    }
    if current.starts_with('\'') {
        current
    } else {
        current.to_ascii_lowercase()
    }
}

fn strip_trailing_cast(raw: &str) -> String {
    let mut in_quote = false;
    let mut depth = 0i32;
    let bytes: Vec<char> = raw.chars().collect();
    let mut cut = None;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => depth -= 1,
            ':' if !in_quote && depth == 0 && bytes.get(i + 1) == Some(&':') => {
                cut = Some(i);
                break;
            }
            _ => {}
        }
        i += 1;
    }
    match cut {
        Some(pos) => bytes[..pos].iter().collect::<String>().trim().to_string(),
        None => raw.trim().to_string(),
    }
}

pub(crate) fn strip_outer_parens(raw: &str) -> String {
    let trimmed = raw.trim();
    if !(trimmed.starts_with('(') && trimmed.ends_with(')')) {
        return trimmed.to_string();
    }
    // only strip if the opening paren closes at the very end
    let mut depth = 0i32;
    let mut in_quote = false;
    for (idx, c) in trimmed.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth -= 1;
                if depth == 0 && idx != trimmed.len() - 1 {
                    return trimmed.to_string();
                }
            }
            _ => {}
        }
    }
    trimmed[1..trimmed.len() - 1].trim().to_string()
}

/// Normalise a check expression for structural comparison.
pub fn normalize_expression(raw: &str) -> String {
    let mut current = raw.trim().to_string();
    if current.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("check")) {
        current = current[5..].trim().to_string();
    }
    loop {
        let stripped = strip_outer_parens(&current);
        if stripped == current {
            break;
        }
        current = stripped;
    }
    current
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '(' && *c != ')' && *c != '"')
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_postgres_spellings() {
        assert_eq!(ColumnType::parse("int4"), ColumnType::Integer);
        assert_eq!(
            ColumnType::parse("character varying(255)"),
            ColumnType::Varchar { length: Some(255) }
        );
        assert_eq!(
            ColumnType::parse("timestamp with time zone"),
            ColumnType::TimestampTz
        );
        assert_eq!(
            ColumnType::parse("timestamp(3) with time zone"),
            ColumnType::TimestampTz
        );
        assert_eq!(
            ColumnType::parse("numeric(10,2)"),
            ColumnType::Numeric {
                precision: Some(10),
                scale: Some(2)
            }
        );
        assert_eq!(ColumnType::parse("jsonb"), ColumnType::Json { binary: true });
    }

    #[test]
    fn test_parse_sqlite_spellings() {
        assert_eq!(ColumnType::parse("INTEGER"), ColumnType::Integer);
        assert_eq!(
            ColumnType::parse("VARCHAR(255)"),
            ColumnType::Varchar { length: Some(255) }
        );
        assert_eq!(ColumnType::parse("DATETIME"), ColumnType::Timestamp);
        assert_eq!(ColumnType::parse("BLOB"), ColumnType::Blob);
        assert_eq!(
            ColumnType::parse("geometry"),
            ColumnType::Other {
                name: "geometry".into()
            }
        );
    }

    #[test]
    fn test_families() {
        assert_eq!(ColumnType::Serial.family(), TypeFamily::Integer);
        assert_eq!(ColumnType::Text.family(), TypeFamily::String);
        assert_eq!(ColumnType::TimestampTz.family(), TypeFamily::Temporal);
        assert_eq!(ColumnType::Integer.integer_digits(), Some(10));
    }

    #[test]
    fn test_display_reparses() {
        for ty in [
            ColumnType::Varchar { length: Some(40) },
            ColumnType::Double,
            ColumnType::Numeric {
                precision: Some(12),
                scale: Some(4),
            },
            ColumnType::TimestampTz,
        ] {
            assert_eq!(ColumnType::parse(&ty.to_string()), ty);
        }
    }

    #[test]
    fn test_normalize_default() {
        assert_eq!(normalize_default("'active'::character varying"), "'active'");
        assert_eq!(normalize_default("(0)"), "0");
        assert_eq!(normalize_default("CURRENT_TIMESTAMP"), "current_timestamp");
        assert_eq!(normalize_default("'a::b'"), "'a::b'");
    }

    #[test]
    fn test_normalize_expression() {
        assert_eq!(
            normalize_expression("CHECK ((age > 0))"),
            normalize_expression("age > 0")
        );
        assert_eq!(normalize_expression("(\"age\" >= 18)"), "age>=18");
    }
}
