//! Table introspection and column type classification.

use crate::db::{Database, DbError, DbResult, Dialect, FetchMode, result::scalar_to_string};
use serde_json::Value;
use std::fmt;

use super::parse_query;

/// Index name with its columns, in definition order.
pub type IndexList = Vec<(String, Vec<String>)>;

/// A column name and its upper-cased declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub r#type: String,
}

/// Value family of a column type, deciding how input values are coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    String,
    Float,
    Date,
    Time,
    DateTime,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Int => "int",
            FieldType::String => "string",
            FieldType::Float => "float",
            FieldType::Date => "date",
            FieldType::Time => "time",
            FieldType::DateTime => "datetime",
        };
        f.write_str(name)
    }
}

/// Base type name and the text between the first parentheses, if any.
fn split_type(r#type: &str, dialect: Dialect) -> (String, Option<String>) {
    let parsed = parse_query(r#type, dialect);
    let parsed = parsed.trim();
    match parsed.split_once('(') {
        Some((base, rest)) => (
            base.trim().to_uppercase(),
            rest.split(')').next().map(|arg| arg.trim().to_string()),
        ),
        None => (parsed.to_uppercase(), None),
    }
}

pub fn get_field_type(r#type: &str, dialect: Dialect) -> DbResult<FieldType> {
    let (base, _) = split_type(r#type, dialect);
    let family = match base.as_str() {
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "INTEGER" => FieldType::Int,
        "TINYTEXT" | "TEXT" | "MEDIUMTEXT" | "LONGTEXT" | "VARCHAR" => FieldType::String,
        "DECIMAL" | "NUMERIC" | "FLOAT" | "REAL" | "DOUBLE" => FieldType::Float,
        "DATE" => FieldType::Date,
        "TIME" => FieldType::Time,
        "DATETIME" => FieldType::DateTime,
        other => return Err(DbError::Invalid(format!("Unknown type '{}'", other))),
    };
    Ok(family)
}

/// Maximum length in bytes of a string column. A `VARCHAR` without a
/// declared length counts as 255.
pub fn get_field_size(r#type: &str, dialect: Dialect) -> DbResult<u64> {
    let (base, arg) = split_type(r#type, dialect);
    let size = match base.as_str() {
        "TINYTEXT" => 255,
        "TEXT" => 65_535,
        "MEDIUMTEXT" => 16_777_215,
        "LONGTEXT" => 4_294_967_295,
        "VARCHAR" => arg.and_then(|arg| arg.parse::<u64>().ok()).unwrap_or(255),
        other => return Err(DbError::Invalid(format!("Unknown type '{}'", other))),
    };
    Ok(size)
}

fn field_text(row: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    row.get(key).map(scalar_to_string)
}

pub async fn get_fields(db: &Database, table: &str) -> DbResult<Vec<Field>> {
    let query = format!(
        "/*MYSQL SHOW COLUMNS FROM {table} *//*SQLITE PRAGMA TABLE_INFO({table}) */"
    );
    let rows = db.query(&query, &[]).await?.into_records();
    let fields = rows
        .iter()
        .filter_map(|row| {
            let name = field_text(row, "Field").or_else(|| field_text(row, "name"))?;
            let r#type = field_text(row, "Type").or_else(|| field_text(row, "type"))?;
            Some(Field {
                name,
                r#type: r#type.to_uppercase(),
            })
        })
        .collect();
    Ok(fields)
}

pub async fn get_tables(db: &Database) -> DbResult<Vec<String>> {
    let query = "/*MYSQL SHOW TABLES *//*SQLITE SELECT name FROM sqlite_master
        WHERE type='table' AND name NOT LIKE 'sqlite_%' */";
    let result = db.fetch(query, FetchMode::Column, &[]).await?;
    Ok(result.fetch_all().iter().map(scalar_to_string).collect())
}

/// Secondary indexes of `table` with their column lists, in definition order.
/// The MySQL primary key is not included.
pub async fn get_indexes(db: &Database, table: &str) -> DbResult<IndexList> {
    let mut indexes = IndexList::new();
    match db.dialect()? {
        Dialect::Sqlite => {
            let list = db
                .query(&format!("PRAGMA INDEX_LIST({})", table), &[])
                .await?
                .into_records();
            for row in list {
                let Some(index) = field_text(&row, "name") else {
                    continue;
                };
                let columns = db
                    .query(&format!("PRAGMA INDEX_INFO({})", index), &[])
                    .await?
                    .into_records()
                    .iter()
                    .filter_map(|row| field_text(row, "name"))
                    .collect();
                indexes.push((index, columns));
            }
        }
        Dialect::Mysql => {
            let rows = db
                .query(&format!("SHOW INDEXES FROM {}", table), &[])
                .await?
                .into_records();
            for row in rows {
                let (Some(index), Some(column)) =
                    (field_text(&row, "Key_name"), field_text(&row, "Column_name"))
                else {
                    continue;
                };
                if index == "PRIMARY" {
                    continue;
                }
                match indexes.iter_mut().find(|(name, _)| *name == index) {
                    Some((_, columns)) => columns.push(column),
                    None => indexes.push((index, vec![column])),
                }
            }
        }
    }
    Ok(indexes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_types() {
        assert_eq!(get_field_type("INTEGER", Dialect::Sqlite).unwrap(), FieldType::Int);
        assert_eq!(get_field_type("varchar(40)", Dialect::Sqlite).unwrap(), FieldType::String);
        assert_eq!(get_field_type("DECIMAL(10,2)", Dialect::Mysql).unwrap(), FieldType::Float);
        assert_eq!(get_field_type("DATETIME", Dialect::Mysql).unwrap(), FieldType::DateTime);
        let err = get_field_type("BLOB", Dialect::Sqlite).unwrap_err();
        assert_eq!(err.to_string(), "Unknown type 'BLOB'");
    }

    #[test]
    fn sizes_of_string_types() {
        assert_eq!(get_field_size("VARCHAR(40)", Dialect::Sqlite).unwrap(), 40);
        assert_eq!(get_field_size("VARCHAR", Dialect::Sqlite).unwrap(), 255);
        assert_eq!(get_field_size("MEDIUMTEXT", Dialect::Mysql).unwrap(), 16_777_215);
        assert!(get_field_size("INTEGER", Dialect::Mysql).is_err());
    }

    #[test]
    fn dialect_fragments_in_types() {
        let r#type = "/*MYSQL MEDIUMTEXT *//*SQLITE TEXT */";
        assert_eq!(get_field_size(r#type, Dialect::Sqlite).unwrap(), 65_535);
        assert_eq!(get_field_size(r#type, Dialect::Mysql).unwrap(), 16_777_215);
    }

    #[tokio::test]
    async fn introspects_sqlite_tables() {
        let db = crate::test_support::memory_db().await;
        db.query(
            "CREATE TABLE demo (id INTEGER PRIMARY KEY, name VARCHAR(20), born DATE)",
            &[],
        )
        .await
        .unwrap();
        db.query("CREATE INDEX demo_name ON demo (name)", &[]).await.unwrap();

        let fields = get_fields(&db, "demo").await.unwrap();
        let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "born"]);
        assert_eq!(fields[1].r#type, "VARCHAR(20)");

        assert!(get_tables(&db).await.unwrap().contains(&"demo".to_string()));

        let indexes = get_indexes(&db, "demo").await.unwrap();
        assert_eq!(indexes, vec![("demo_name".to_string(), vec!["name".to_string()])]);
    }
}
