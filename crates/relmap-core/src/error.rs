//! Error types for relmap operations.

use std::fmt;

/// The error type shared by every relmap crate.
#[derive(Debug)]
pub enum Error {
    /// Failure reported by the database collaborator
    Query(QueryError),
    /// Two distinct instances claim the same identity key in one session
    IdentityConflict(IdentityConflictError),
    /// Operation attempted on a unit of work in a terminal state
    UnitOfWorkInvalid(UnitOfWorkInvalidError),
    /// Predicate cannot be evaluated in memory the way SQL would evaluate it
    ConformanceConflict(ConformanceError),
    /// Missing or malformed mapping metadata
    Descriptor(DescriptorError),
    /// A value does not fit the attribute it is written to
    Type(TypeError),
    Schema(SchemaError),
    /// Foreign-key dependency cycle among objects scheduled for insert
    Cycle(CycleError),
    Cancelled,
    Serde(String),
    Custom(String),
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    Syntax,
    /// Unique, foreign-key or check violation
    Constraint,
    /// Table or column not found
    NotFound,
    /// UPDATE or DELETE matched no row although one was expected
    OptimisticLock,
    Database,
}

#[derive(Debug)]
pub struct IdentityConflictError {
    /// Rendered identity key, e.g. `Employee[5]`
    pub key: String,
    pub message: String,
}

#[derive(Debug)]
pub struct UnitOfWorkInvalidError {
    /// The operation that was rejected
    pub operation: &'static str,
    /// Name of the terminal state the unit of work is in
    pub state: &'static str,
}

#[derive(Debug)]
pub struct ConformanceError {
    pub entity: String,
    pub message: String,
}

#[derive(Debug)]
pub struct DescriptorError {
    pub kind: DescriptorErrorKind,
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorErrorKind {
    UnknownEntity,
    UnknownAttribute,
    MissingPrimaryKey,
    /// Entity registered twice
    Duplicate,
    /// Registry could not be installed or is malformed
    Registry,
    /// Object state cannot be read or written through the descriptor
    Access,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub table: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// A descriptor cannot be turned into a table definition
    Invalid,
    /// The database rejected a DDL statement
    DdlFailed,
}

#[derive(Debug)]
pub struct CycleError {
    /// Identity keys or entity names participating in the cycle
    pub members: Vec<String>,
}

impl Error {
    pub fn is_identity_conflict(&self) -> bool {
        matches!(self, Error::IdentityConflict(_))
    }

    /// Was this raised because a unit of work is no longer usable?
    pub fn is_unit_of_work_invalid(&self) -> bool {
        matches!(self, Error::UnitOfWorkInvalid(_))
    }

    /// SQLSTATE reported by the database, e.g. `"23505"` for a unique violation.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Shorthand for a database error with a message.
    pub fn database(message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Database,
            sql: None,
            sqlstate: None,
            message: message.into(),
            source: None,
        })
    }

    pub fn unknown_entity(entity: &str) -> Self {
        Error::Descriptor(DescriptorError {
            kind: DescriptorErrorKind::UnknownEntity,
            entity: entity.to_string(),
            message: format!("no descriptor registered for entity '{entity}'"),
        })
    }

    pub fn unknown_attribute(entity: &str, attribute: &str) -> Self {
        Error::Descriptor(DescriptorError {
            kind: DescriptorErrorKind::UnknownAttribute,
            entity: entity.to_string(),
            message: format!("entity '{entity}' has no mapped attribute '{attribute}'"),
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => write!(f, "Query error: {e}"),
            Error::IdentityConflict(e) => write!(f, "Identity conflict on {}: {}", e.key, e.message),
            Error::UnitOfWorkInvalid(e) => write!(f, "{e}"),
            Error::ConformanceConflict(e) => {
                write!(f, "Conformance conflict on {}: {}", e.entity, e.message)
            }
            Error::Descriptor(e) => write!(f, "Descriptor error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {e}"),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Cycle(e) => write!(f, "{e}"),
            Error::Cancelled => f.write_str("Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {msg}"),
            Error::Custom(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source = match self {
            Error::Query(e) => e.source.as_deref(),
            Error::Schema(e) => e.source.as_deref(),
            _ => None,
        };
        source.map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(state) => write!(f, "{} (SQLSTATE {state})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl fmt::Display for UnitOfWorkInvalidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unit of work is {} and cannot {}; acquire a new one",
            self.state, self.operation
        )
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}", self.expected)?;
        if let Some(column) = &self.column {
            write!(f, " for column '{column}'")?;
        }
        write!(f, ", found {}", self.actual)
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Foreign-key cycle detected among: {}", self.members.join(", "))
    }
}

macro_rules! error_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for Error {
                fn from(err: $source) -> Self {
                    Error::$variant(err)
                }
            }
        )*
    };
}

error_from! {
    QueryError => Query,
    IdentityConflictError => IdentityConflict,
    UnitOfWorkInvalidError => UnitOfWorkInvalid,
    ConformanceError => ConformanceConflict,
    DescriptorError => Descriptor,
    TypeError => Type,
    SchemaError => Schema,
    CycleError => Cycle,
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
