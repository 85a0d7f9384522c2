/// Statically declared entity metadata
///
/// Backends never introspect entity types. Each repository is constructed
/// with an `EntitySchema` naming the table/collection/key namespace, the
/// primary key, and the logical-field to column mapping.

use crate::{Error, Result, Value};

/// Storage type of a field, used when decoding relational rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    /// Lists and other structured values, stored as JSON text in SQL
    Json,
}

impl FieldKind {
    fn sql_type(&self) -> &'static str {
        match self {
            FieldKind::Bool => "INTEGER",
            FieldKind::Int => "INTEGER",
            FieldKind::Float => "REAL",
            FieldKind::Text => "TEXT",
            FieldKind::Bytes => "BLOB",
            FieldKind::Json => "TEXT",
        }
    }
}

/// How primary keys are produced on create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStrategy {
    /// The caller always supplies the id
    Provided,
    /// The relational engine assigns an integer id (rowid)
    AutoIncrement,
    /// A random UUID string is generated when the id is missing
    Uuid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Logical name, as seen by entities and queries
    pub name: String,
    /// Column / document field / record key name in the backend
    pub column: String,
    pub kind: FieldKind,
    pub nullable: bool,
    pub unique: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            kind,
            nullable: true,
            unique: false,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    /// Table, collection or key namespace
    pub name: String,
    /// Logical name of the primary key field
    pub primary_key: String,
    pub id_strategy: IdStrategy,
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            id_strategy: IdStrategy::Provided,
            fields: Vec::new(),
        }
    }

    pub fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Backend column for a logical field; unknown fields map to themselves
    pub fn column_for<'a>(&'a self, name: &'a str) -> &'a str {
        self.get_field(name).map(|f| f.column.as_str()).unwrap_or(name)
    }

    /// Logical field for a backend column; unknown columns map to themselves
    pub fn field_for_column<'a>(&'a self, column: &'a str) -> &'a str {
        self.fields
            .iter()
            .find(|f| f.column == column)
            .map(|f| f.name.as_str())
            .unwrap_or(column)
    }

    pub fn pk_column(&self) -> &str {
        self.column_for(&self.primary_key)
    }

    pub fn is_primary_key(&self, field: &str) -> bool {
        field == self.primary_key || field == "id"
    }

    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.get_field(name).map(|f| f.kind)
    }

    /// Checks internal consistency before a repository accepts the schema
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_argument("schema name must not be empty"));
        }
        if self.get_field(&self.primary_key).is_none() {
            return Err(Error::invalid_argument(format!(
                "primary key '{}' is not a declared field of '{}'",
                self.primary_key, self.name
            )));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::invalid_argument(format!("duplicate field '{}'", field.name)));
            }
        }
        if self.id_strategy == IdStrategy::AutoIncrement
            && self.kind_of(&self.primary_key) != Some(FieldKind::Int)
        {
            return Err(Error::invalid_argument(
                "auto-increment primary keys must be Int fields",
            ));
        }
        Ok(())
    }

    /// CREATE TABLE statement for the relational backend. Migrations are the
    /// caller's concern; this exists for tests and embedded use.
    pub fn create_table_sql(&self) -> String {
        let columns: Vec<String> = self
            .fields
            .iter()
            .map(|f| {
                let mut col = format!("\"{}\" {}", f.column, f.kind.sql_type());
                if f.name == self.primary_key {
                    col.push_str(" PRIMARY KEY");
                    if self.id_strategy == IdStrategy::AutoIncrement {
                        col.push_str(" AUTOINCREMENT");
                    }
                } else {
                    if !f.nullable {
                        col.push_str(" NOT NULL");
                    }
                    if f.unique {
                        col.push_str(" UNIQUE");
                    }
                }
                col
            })
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            self.name,
            columns.join(", ")
        )
    }

    /// Is this value acceptable as an id for this schema?
    pub fn check_id(&self, id: &Value) -> Result<()> {
        match id {
            Value::Null | Value::List(_) => Err(Error::invalid_argument(format!(
                "invalid id for '{}': {}",
                self.name,
                id.type_name()
            ))),
            _ => Ok(()),
        }
    }
}
