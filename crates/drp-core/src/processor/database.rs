//! Export of header values and source rows to a database.
//!
//! The engine talks to storage through [`DatabaseExporter`]; a real
//! deployment supplies its own backend. [`InMemoryDatabase`] implements the
//! same duplicate handling and is used for tests and dry runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{Batch, Header, HeaderValue};

use super::{Processor, ProcessorError, ProcessorKind, StepContext, StepResult};

/// What to do when a row with the same unique key already exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateProtocol {
    #[default]
    Fail,
    Ignore,
    Replace,
}

pub trait DatabaseExporter: Send + Sync {
    /// Insert `row` into `table`, returning the names and values of the
    /// generated keys of the stored row.
    fn export(
        &self,
        table: &str,
        row: &Header,
        protocol: DuplicateProtocol,
    ) -> StepResult<(Vec<String>, Vec<HeaderValue>)>;
}

/// Columns of a table, the column that must be unique, and the name of the
/// generated serial id.
#[derive(Clone, Debug)]
pub struct TableSchema {
    pub columns: Vec<String>,
    pub unique_column: String,
    pub id_column: String,
}

#[derive(Default)]
struct StoredTable {
    rows: IndexMap<String, (i64, Header)>,
    next_id: i64,
}

#[derive(Default)]
pub struct InMemoryDatabase {
    schemas: HashMap<String, TableSchema>,
    tables: Mutex<HashMap<String, StoredTable>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, schema: TableSchema) -> Self {
        self.schemas.insert(name.to_string(), schema);
        self
    }

    pub fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Stored row with the given unique value, if any.
    pub fn get(&self, table: &str, unique_value: &str) -> Option<Header> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables
            .get(table)
            .and_then(|t| t.rows.get(unique_value))
            .map(|(_, row)| row.clone())
    }
}

impl DatabaseExporter for InMemoryDatabase {
    fn export(
        &self,
        table: &str,
        row: &Header,
        protocol: DuplicateProtocol,
    ) -> StepResult<(Vec<String>, Vec<HeaderValue>)> {
        let schema = self
            .schemas
            .get(table)
            .ok_or_else(|| ProcessorError::Database(format!("unknown table '{table}'")))?;

        let mut stored_row = Header::new();
        for column in &schema.columns {
            let value = row.get(column).ok_or_else(|| {
                ProcessorError::Database(format!("column '{column}' missing for table '{table}'"))
            })?;
            stored_row.insert(column.as_str(), value.clone());
        }
        let unique = stored_row
            .get_text(&schema.unique_column)
            .ok_or_else(|| {
                ProcessorError::Database(format!(
                    "unique column '{}' is not a column of '{table}'",
                    schema.unique_column
                ))
            })?;

        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = tables.entry(table.to_string()).or_default();

        let id = match stored.rows.get(&unique).map(|(id, _)| *id) {
            Some(id) => match protocol {
                DuplicateProtocol::Fail => {
                    return Err(ProcessorError::Database(format!(
                        "duplicate entry '{unique}' in table '{table}'"
                    )));
                }
                DuplicateProtocol::Ignore => {
                    debug!(table, unique = %unique, "Ignoring duplicate entry");
                    id
                }
                DuplicateProtocol::Replace => {
                    debug!(table, unique = %unique, "Replacing duplicate entry");
                    stored.rows.insert(unique, (id, stored_row));
                    id
                }
            },
            None => {
                stored.next_id += 1;
                let id = stored.next_id;
                stored.rows.insert(unique, (id, stored_row));
                id
            }
        };
        Ok((vec![schema.id_column.clone()], vec![HeaderValue::Int(id)]))
    }
}

/// Exports every image header and writes the generated keys back into it.
pub struct DatabaseImageExporter {
    db: Arc<dyn DatabaseExporter>,
    table: String,
    duplicate_protocol: DuplicateProtocol,
}

impl DatabaseImageExporter {
    pub fn new(db: Arc<dyn DatabaseExporter>, table: &str, duplicate_protocol: DuplicateProtocol) -> Self {
        Self {
            db,
            table: table.to_string(),
            duplicate_protocol,
        }
    }
}

impl Processor for DatabaseImageExporter {
    fn key(&self) -> &'static str {
        "dbexport"
    }

    fn description(&self) -> String {
        format!("Export image headers to table '{}'", self.table)
    }

    fn process(&self, mut batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        for block in batch.iter_mut() {
            let (keys, values) = self
                .db
                .export(&self.table, block.header(), self.duplicate_protocol)?;
            for (key, value) in keys.into_iter().zip(values) {
                block.header_mut().insert(key, value);
            }
        }
        Ok(batch)
    }
}

/// Exports every source row and adds the generated keys as columns.
pub struct DatabaseSourceExporter {
    db: Arc<dyn DatabaseExporter>,
    table: String,
    duplicate_protocol: DuplicateProtocol,
}

impl DatabaseSourceExporter {
    pub fn new(db: Arc<dyn DatabaseExporter>, table: &str, duplicate_protocol: DuplicateProtocol) -> Self {
        Self {
            db,
            table: table.to_string(),
            duplicate_protocol,
        }
    }
}

impl Processor for DatabaseSourceExporter {
    fn key(&self) -> &'static str {
        "dbexport_sources"
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::SourcesToSources
    }

    fn description(&self) -> String {
        format!("Export source rows to table '{}'", self.table)
    }

    fn process(&self, batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        let mut tables = batch.into_sources()?;
        for source in tables.iter_mut() {
            let mut generated: IndexMap<String, Vec<HeaderValue>> = IndexMap::new();
            for i in 0..source.data().len() {
                let Some(row) = source.data().row_as_header(i) else {
                    continue;
                };
                let (keys, values) = self.db.export(&self.table, &row, self.duplicate_protocol)?;
                for (key, value) in keys.into_iter().zip(values) {
                    generated.entry(key).or_default().push(value);
                }
            }
            for (key, values) in generated {
                source.data_mut().set_column(&key, values)?;
            }
        }
        Ok(Batch::sources(tables))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> InMemoryDatabase {
        InMemoryDatabase::new().with_table(
            "raw",
            TableSchema {
                columns: vec!["BASENAME".into(), "EXPTIME".into()],
                unique_column: "BASENAME".into(),
                id_column: "RAWID".into(),
            },
        )
    }

    fn row(name: &str, exptime: f64) -> Header {
        Header::new().with("BASENAME", name).with("EXPTIME", exptime)
    }

    #[test]
    fn duplicate_protocols() {
        let db = db();
        let (keys, first) = db.export("raw", &row("a", 1.0), DuplicateProtocol::Fail).unwrap();
        assert_eq!(keys, vec!["RAWID"]);
        assert_eq!(first, vec![HeaderValue::Int(1)]);

        assert!(matches!(
            db.export("raw", &row("a", 2.0), DuplicateProtocol::Fail),
            Err(ProcessorError::Database(_))
        ));

        let (_, ignored) = db.export("raw", &row("a", 2.0), DuplicateProtocol::Ignore).unwrap();
        assert_eq!(ignored, first);
        assert_eq!(db.get("raw", "a").unwrap().get_f64("EXPTIME", "t").unwrap(), 1.0);

        let (_, replaced) = db.export("raw", &row("a", 3.0), DuplicateProtocol::Replace).unwrap();
        assert_eq!(replaced, first);
        assert_eq!(db.get("raw", "a").unwrap().get_f64("EXPTIME", "t").unwrap(), 3.0);

        db.export("raw", &row("b", 1.0), DuplicateProtocol::Fail).unwrap();
        assert_eq!(db.row_count("raw"), 2);
    }

    #[test]
    fn missing_columns_are_database_errors() {
        let db = db();
        let partial = Header::new().with("BASENAME", "a");
        assert!(matches!(
            db.export("raw", &partial, DuplicateProtocol::Fail),
            Err(ProcessorError::Database(_))
        ));
        assert!(db.export("other", &row("a", 1.0), DuplicateProtocol::Fail).is_err());
    }
}
