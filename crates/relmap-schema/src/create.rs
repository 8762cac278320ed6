//! CREATE TABLE, DROP TABLE and foreign-key constraint statements derived
//! from descriptors.
//!
//! SQLite cannot add a constraint to an existing table, so its foreign keys
//! are declared inside CREATE TABLE. Every other dialect creates them with
//! ALTER TABLE once all tables exist, which lets tables reference each other.

use relmap_core::error::{SchemaError, SchemaErrorKind};
use relmap_core::{Descriptor, DescriptorRegistry, Error, Result, SqlType};
use relmap_query::Dialect;

/// One column of a table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
    /// The database assigns this column's value.
    pub generated: bool,
}

/// A foreign key from one column to the single-column key of another table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: &'static str,
    pub target_table: &'static str,
    pub target_column: &'static str,
}

impl ForeignKey {
    /// Name of the constraint enforcing this key on `table`.
    pub fn constraint_name(&self, table: &str) -> String {
        format!("FK_{}_{}", table, self.column)
    }

    fn references_sql(&self, dialect: Dialect) -> String {
        format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            dialect.quote_identifier(self.column),
            dialect.quote_identifier(self.target_table),
            dialect.quote_identifier(self.target_column)
        )
    }
}

/// Whether foreign keys are declared inside CREATE TABLE for `dialect`.
pub fn inline_foreign_keys(dialect: Dialect) -> bool {
    matches!(dialect, Dialect::Sqlite)
}

/// A named constraint statement of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintStatement {
    pub name: String,
    pub sql: String,
}

/// The table a descriptor maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub table: &'static str,
    pub columns: Vec<ColumnDefinition>,
    pub primary_key: Vec<&'static str>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDefinition {
    /// Derive the table for `descriptor`.
    ///
    /// Reference mappings become foreign keys when the target entity has a
    /// single-column key. Columns carried by only some variants are always
    /// nullable.
    pub fn from_descriptor(descriptor: &Descriptor, registry: &DescriptorRegistry) -> Result<Self> {
        let variant_specific: Vec<usize> = descriptor
            .variants()
            .iter()
            .flat_map(|v| v.attributes().iter().copied())
            .collect();

        let mut columns = Vec::with_capacity(descriptor.mappings().len());
        let mut foreign_keys = Vec::new();
        for (index, mapping) in descriptor.mappings().iter().enumerate() {
            let in_key = descriptor.primary_key().contains(&index);
            columns.push(ColumnDefinition {
                name: mapping.column(),
                sql_type: mapping.sql_type().clone(),
                nullable: !in_key && (mapping.nullable() || variant_specific.contains(&index)),
                generated: in_key && descriptor.has_generated_key(),
            });

            if let Some(target) = mapping.reference_target() {
                let target = registry.descriptor(target)?;
                if let [key] = target.primary_key() {
                    foreign_keys.push(ForeignKey {
                        column: mapping.column(),
                        target_table: target.table(),
                        target_column: target.mappings()[*key].column(),
                    });
                }
            }
        }

        if columns.is_empty() {
            return Err(Error::Schema(SchemaError {
                kind: SchemaErrorKind::Invalid,
                table: Some(descriptor.table().to_string()),
                message: "table has no columns".to_string(),
                source: None,
            }));
        }

        Ok(Self {
            table: descriptor.table(),
            columns,
            primary_key: descriptor
                .primary_key()
                .iter()
                .map(|&i| descriptor.mappings()[i].column())
                .collect(),
            foreign_keys,
        })
    }

    fn column_sql(column: &ColumnDefinition, dialect: Dialect) -> String {
        let mut def = format!("{} ", dialect.quote_identifier(column.name));
        if column.generated {
            match dialect {
                Dialect::Postgres => {
                    def.push_str(&column.sql_type.sql_name());
                    def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
                }
                // Only INTEGER aliases the rowid.
                Dialect::Sqlite => def.push_str("INTEGER"),
                Dialect::Mysql => {
                    def.push_str(&column.sql_type.sql_name());
                    def.push_str(" AUTO_INCREMENT");
                }
            }
        } else {
            def.push_str(&column.sql_type.sql_name());
        }
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        def
    }

    /// Build the CREATE TABLE statement.
    ///
    /// Foreign keys are only included where [`inline_foreign_keys`] holds;
    /// elsewhere they come from [`TableDefinition::add_constraints_sql`].
    pub fn create_sql(&self, dialect: Dialect, if_not_exists: bool) -> String {
        let mut sql = String::from("CREATE TABLE ");
        if if_not_exists {
            sql.push_str("IF NOT EXISTS ");
        }
        sql.push_str(&dialect.quote_identifier(self.table));
        sql.push_str(" (\n  ");

        let quote_all = |cols: &[&'static str]| {
            cols.iter()
                .map(|c| dialect.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| Self::column_sql(c, dialect))
            .collect();
        parts.push(format!("PRIMARY KEY ({})", quote_all(&self.primary_key)));
        if inline_foreign_keys(dialect) {
            parts.extend(self.foreign_keys.iter().map(|fk| fk.references_sql(dialect)));
        }

        sql.push_str(&parts.join(",\n  "));
        sql.push_str("\n)");
        sql
    }

    /// ALTER TABLE statements adding each foreign key; empty when the
    /// dialect declares them inline.
    pub fn add_constraints_sql(&self, dialect: Dialect) -> Vec<ConstraintStatement> {
        if inline_foreign_keys(dialect) {
            return Vec::new();
        }
        let table = dialect.quote_identifier(self.table);
        self.foreign_keys
            .iter()
            .map(|fk| {
                let name = fk.constraint_name(self.table);
                let sql = format!(
                    "ALTER TABLE {table} ADD CONSTRAINT {} {}",
                    dialect.quote_identifier(&name),
                    fk.references_sql(dialect)
                );
                ConstraintStatement { name, sql }
            })
            .collect()
    }

    /// ALTER TABLE statements removing each foreign key added by
    /// [`TableDefinition::add_constraints_sql`].
    pub fn drop_constraints_sql(&self, dialect: Dialect) -> Vec<ConstraintStatement> {
        if inline_foreign_keys(dialect) {
            return Vec::new();
        }
        let table = dialect.quote_identifier(self.table);
        let clause = match dialect {
            Dialect::Mysql => "DROP FOREIGN KEY",
            _ => "DROP CONSTRAINT",
        };
        self.foreign_keys
            .iter()
            .map(|fk| {
                let name = fk.constraint_name(self.table);
                let sql = format!("ALTER TABLE {table} {clause} {}", dialect.quote_identifier(&name));
                ConstraintStatement { name, sql }
            })
            .collect()
    }

    /// Build the DROP TABLE statement.
    pub fn drop_sql(&self, dialect: Dialect, if_exists: bool) -> String {
        drop_table_sql(self.table, dialect, if_exists)
    }
}

/// Generate DROP TABLE SQL for `table`.
pub fn drop_table_sql(table: &str, dialect: Dialect, if_exists: bool) -> String {
    if if_exists {
        format!("DROP TABLE IF EXISTS {}", dialect.quote_identifier(table))
    } else {
        format!("DROP TABLE {}", dialect.quote_identifier(table))
    }
}
