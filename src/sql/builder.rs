//! INSERT/UPDATE/WHERE builders driven by the table's column types, plus the
//! LIKE based search filter.

use crate::{
    datetime::{dateval, datetimeval, timeval},
    db::{Database, DbError, DbResult, Record, floatval, intval, result::scalar_to_string},
    text::encode_bad_chars,
};
use serde_json::{Number, Value};

use super::schema::{FieldType, get_field_size, get_field_type, get_fields};

const RESERVED_WORDS: [&str; 4] = ["key", "table", "from", "to"];

/// Back-quote column names that collide with SQL keywords.
pub fn escape_reserved_word(word: &str) -> String {
    if RESERVED_WORDS.contains(&word) {
        format!("`{}`", word)
    } else {
        word.to_string()
    }
}

/// Cut `value` to at most `size` bytes without splitting a character.
fn truncate_bytes(value: &str, size: u64) -> String {
    let size = usize::try_from(size).unwrap_or(usize::MAX);
    if value.len() <= size {
        return value.to_string();
    }
    let mut end = size;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// Convert an input value to what a column of `field_type` stores.
pub fn coerce_value(field_type: FieldType, size: u64, value: &Value) -> Value {
    match field_type {
        FieldType::Int => Value::from(intval(value)),
        FieldType::Float => Number::from_f64(floatval(value))
            .map(Value::Number)
            .unwrap_or_else(|| Value::from(0)),
        FieldType::Date => Value::String(dateval(&scalar_to_string(value))),
        FieldType::Time => Value::String(timeval(&scalar_to_string(value))),
        FieldType::DateTime => Value::String(datetimeval(&scalar_to_string(value))),
        FieldType::String => Value::String(truncate_bytes(&scalar_to_string(value), size)),
    }
}

/// Column names (reserved words quoted) and coerced values of `data`, in
/// table column order. Keys that are not columns of `table` are an error.
async fn prepare_helper(
    db: &Database,
    table: &str,
    data: &Record,
) -> DbResult<(Vec<String>, Vec<Value>)> {
    let dialect = db.dialect()?;
    let fields = get_fields(db, table).await?;
    let mut names = Vec::new();
    let mut values = Vec::new();
    for field in &fields {
        let Some(value) = data.get(&field.name) else {
            continue;
        };
        let field_type = get_field_type(&field.r#type, dialect)?;
        let size = match field_type {
            FieldType::String => get_field_size(&field.r#type, dialect)?,
            _ => 0,
        };
        names.push(escape_reserved_word(&field.name));
        values.push(coerce_value(field_type, size, value));
    }
    let unused: Vec<&str> = data
        .keys()
        .filter(|key| !fields.iter().any(|field| &field.name == *key))
        .map(String::as_str)
        .collect();
    if !unused.is_empty() {
        return Err(DbError::Invalid(format!("Unused data '{}'", unused.join(", "))));
    }
    Ok((names, values))
}

fn quoted(db: &Database, value: &Value) -> DbResult<String> {
    Ok(format!("'{}'", db.escape(&scalar_to_string(value))?))
}

fn assignments(db: &Database, names: &[String], values: &[Value]) -> DbResult<Vec<String>> {
    names
        .iter()
        .zip(values)
        .map(|(name, value)| Ok(format!("{}={}", name, quoted(db, value)?)))
        .collect()
}

pub async fn make_insert_query(db: &Database, table: &str, data: &Record) -> DbResult<String> {
    let (names, values) = prepare_helper(db, table, data).await?;
    let values = values
        .iter()
        .map(|value| quoted(db, value))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(format!(
        "INSERT INTO {}({}) VALUES({})",
        table,
        names.join(","),
        values.join(",")
    ))
}

pub async fn make_update_query(
    db: &Database,
    table: &str,
    data: &Record,
    filter: &Record,
) -> DbResult<String> {
    let (names, values) = prepare_helper(db, table, data).await?;
    let mut query = format!("UPDATE {} SET {}", table, assignments(db, &names, &values)?.join(","));
    if !filter.is_empty() {
        query.push_str(" WHERE ");
        query.push_str(&make_where_query(db, table, filter).await?);
    }
    Ok(query)
}

pub async fn make_where_query(db: &Database, table: &str, filter: &Record) -> DbResult<String> {
    let (names, values) = prepare_helper(db, table, filter).await?;
    Ok(format!("({})", assignments(db, &names, &values)?.join(" AND ")))
}

pub async fn prepare_insert_query(
    db: &Database,
    table: &str,
    data: &Record,
) -> DbResult<(String, Vec<Value>)> {
    let (names, values) = prepare_helper(db, table, data).await?;
    let marks = vec!["?"; names.len()].join(",");
    Ok((
        format!("INSERT INTO {}({}) VALUES({})", table, names.join(","), marks),
        values,
    ))
}

pub async fn prepare_update_query(
    db: &Database,
    table: &str,
    data: &Record,
    filter: &Record,
) -> DbResult<(String, Vec<Value>)> {
    let (names, mut values) = prepare_helper(db, table, data).await?;
    let sets: Vec<String> = names.iter().map(|name| format!("{}=?", name)).collect();
    let mut query = format!("UPDATE {} SET {}", table, sets.join(","));
    if !filter.is_empty() {
        let (clause, more) = prepare_where_query(db, table, filter).await?;
        query.push_str(" WHERE ");
        query.push_str(&clause);
        values.extend(more);
    }
    Ok((query, values))
}

pub async fn prepare_where_query(
    db: &Database,
    table: &str,
    filter: &Record,
) -> DbResult<(String, Vec<Value>)> {
    let (names, values) = prepare_helper(db, table, filter).await?;
    let terms: Vec<String> = names.iter().map(|name| format!("{}=?", name)).collect();
    Ok((format!("({})", terms.join(" AND ")), values))
}

/// True when `needle` is an element of the comma separated list stored in
/// `column`. MySQL has `FIND_IN_SET`; SQLite matches the comma padded text.
pub fn find_in_set(needle: i64, column: &str) -> String {
    format!(
        "/*MYSQL FIND_IN_SET({needle},{column}) *//*SQLITE (','||{column}||',') LIKE '%,{needle},%' */"
    )
}

/// Search filter over the comma separated `keys`.
///
/// `values` is split into words after sanitizing; a word prefixed with `-`
/// must match no key, any other word must match at least one. Words shorter
/// than `minsize` are ignored. Returns `default` when there is nothing to
/// filter on.
pub fn make_like_query(keys: &str, values: &str, minsize: usize, default: &str) -> String {
    let keys: Vec<&str> = keys
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .collect();
    if keys.is_empty() {
        return default.to_string();
    }
    let words: Vec<(char, String)> = encode_bad_chars(values, ' ', "+-")
        .split(' ')
        .filter_map(|word| {
            let sign = word
                .chars()
                .take_while(|c| *c == '+' || *c == '-')
                .last()
                .unwrap_or('+');
            let word = word.trim_start_matches(['+', '-']);
            (word.len() >= minsize.max(1)).then(|| (sign, word.to_string()))
        })
        .collect();
    if words.is_empty() {
        return default.to_string();
    }
    let terms: Vec<String> = words
        .iter()
        .map(|(sign, word)| {
            if *sign == '-' {
                let parts: Vec<String> = keys
                    .iter()
                    .map(|key| format!("{} NOT LIKE '%{}%'", key, word))
                    .collect();
                format!("({})", parts.join(" AND "))
            } else {
                let parts: Vec<String> = keys
                    .iter()
                    .map(|key| format!("{} LIKE '%{}%'", key, word))
                    .collect();
                format!("({})", parts.join(" OR "))
            }
        })
        .collect();
    format!("({})", terms.join(" AND "))
}

/// Restrict `id` to the rows of `table` whose search index matches `values`.
pub fn make_fulltext_query(
    values: &str,
    table: &str,
    prefix: &str,
    minsize: usize,
    default: &str,
) -> String {
    let filter = make_like_query("search", values, minsize, default);
    if filter == default {
        return filter;
    }
    format!("{}id IN (SELECT id FROM {}_index WHERE {})", prefix, table, filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::record;
    use serde_json::json;

    async fn demo_db() -> Database {
        let db = crate::test_support::memory_db().await;
        db.query(
            "CREATE TABLE demo (id INTEGER, name VARCHAR(5), price DECIMAL(10,2), born DATE, `key` TEXT)",
            &[],
        )
        .await
        .unwrap();
        db
    }

    #[test]
    fn like_query_words_and_exclusions() {
        assert_eq!(
            make_like_query("name, city", "Ana -Reus", 1, "1=0"),
            "((name LIKE '%ana%' OR city LIKE '%ana%') AND (name NOT LIKE '%reus%' AND city NOT LIKE '%reus%'))"
        );
        assert_eq!(make_like_query("", "ana", 1, "1=0"), "1=0");
        assert_eq!(make_like_query("name", "a b", 2, "1=0"), "1=0");
        assert_eq!(make_like_query("name", "'; DROP", 1, "1=0"), "((name LIKE '%drop%'))");
    }

    #[test]
    fn fulltext_query_wraps_index_lookup() {
        assert_eq!(
            make_fulltext_query("acme", "app_customers", "", 1, "1=0"),
            "id IN (SELECT id FROM app_customers_index WHERE ((search LIKE '%acme%')))"
        );
        assert_eq!(make_fulltext_query("", "app_customers", "", 1, "1=0"), "1=0");
    }

    #[test]
    fn find_in_set_per_dialect() {
        use crate::{db::Dialect, sql::parse_query};
        let sql = find_in_set(5, "users_id");
        assert_eq!(parse_query(&sql, Dialect::Mysql), "FIND_IN_SET(5,users_id)");
        assert_eq!(parse_query(&sql, Dialect::Sqlite), "(','||users_id||',') LIKE '%,5,%'");
    }

    #[tokio::test]
    async fn find_in_set_matches_whole_elements() {
        let db = crate::test_support::memory_db().await;
        let hit = db.execute_scalar(&format!("SELECT {} FROM (SELECT '1,15,3' AS users_id)", find_in_set(15, "users_id")), &[]).await.unwrap();
        let miss = db.execute_scalar(&format!("SELECT {} FROM (SELECT '1,15,3' AS users_id)", find_in_set(5, "users_id")), &[]).await.unwrap();
        assert_eq!((hit, miss), (1, 0));
    }

    #[test]
    fn reserved_words_are_quoted() {
        assert_eq!(escape_reserved_word("key"), "`key`");
        assert_eq!(escape_reserved_word("name"), "name");
    }

    #[test]
    fn coercion_by_type() {
        assert_eq!(coerce_value(FieldType::Int, 0, &json!("12abc")), json!(12));
        assert_eq!(coerce_value(FieldType::Float, 0, &json!("2.5")), json!(2.5));
        assert_eq!(coerce_value(FieldType::Date, 0, &json!("5/1/2024")), json!("2024-01-05"));
        assert_eq!(coerce_value(FieldType::String, 3, &json!("àbcd")), json!("àb"));
    }

    #[tokio::test]
    async fn insert_and_update_queries_follow_column_order() {
        let db = demo_db().await;
        let data = record(json!({"name": "O'Hara Smith", "id": "7", "key": "k"}));

        let insert = make_insert_query(&db, "demo", &data).await.unwrap();
        assert_eq!(insert, "INSERT INTO demo(id,name,`key`) VALUES('7','O''Har','k')");
        db.query(&insert, &[]).await.unwrap();

        let update = make_update_query(&db, "demo", &record(json!({"price": "9.5"})), &record(json!({"id": 7})))
            .await
            .unwrap();
        assert_eq!(update, "UPDATE demo SET price='9.5' WHERE (id='7')");

        let (query, values) = prepare_update_query(
            &db,
            "demo",
            &record(json!({"born": "2024-13-40"})),
            &record(json!({"id": 7})),
        )
        .await
        .unwrap();
        assert_eq!(query, "UPDATE demo SET born=? WHERE (id=?)");
        assert_eq!(values, vec![json!("2024-12-31"), json!(7)]);
    }

    #[tokio::test]
    async fn unknown_keys_are_rejected() {
        let db = demo_db().await;
        let err = prepare_insert_query(&db, "demo", &record(json!({"name": "x", "foo": 1, "bar": 2})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unused data 'foo, bar'");
    }

    #[tokio::test]
    async fn where_query_joins_with_and() {
        let db = demo_db().await;
        let (query, values) = prepare_where_query(&db, "demo", &record(json!({"name": "ab", "id": 1})))
            .await
            .unwrap();
        assert_eq!(query, "(id=? AND name=?)");
        assert_eq!(values, vec![json!(1), json!("ab")]);
        let inline = make_where_query(&db, "demo", &record(json!({"id": 1}))).await.unwrap();
        assert_eq!(inline, "(id='1')");
    }
}
