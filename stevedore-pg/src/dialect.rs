//! PostgreSQL SQL text and type mapping.

use stevedore_core::{StoreType, TableName};
use stevedore_storage::CreateTable;
use tokio_postgres::types::Type;

/// Double-quoted identifier with embedded quotes doubled.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

pub fn quote_table(table: &TableName) -> String {
    match &table.schema {
        Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(&table.name)),
        None => quote_identifier(&table.name),
    }
}

fn quote_list<S: AsRef<str>>(identifiers: &[S]) -> String {
    identifiers
        .iter()
        .map(|i| quote_identifier(i.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Column type as written in DDL.
pub fn sql_type(store_type: &StoreType) -> String {
    match store_type {
        StoreType::Boolean => "boolean".to_string(),
        StoreType::SmallInt => "smallint".to_string(),
        StoreType::Integer => "integer".to_string(),
        StoreType::BigInt => "bigint".to_string(),
        StoreType::Double => "double precision".to_string(),
        StoreType::Text => "text".to_string(),
        StoreType::VarChar(Some(n)) => format!("varchar({})", n),
        StoreType::VarChar(None) => "varchar".to_string(),
        StoreType::Bytes => "bytea".to_string(),
        StoreType::Uuid => "uuid".to_string(),
        StoreType::TimestampTz => "timestamptz".to_string(),
        StoreType::Json => "jsonb".to_string(),
    }
}

/// Wire type used by the binary COPY writer.
pub fn pg_type(store_type: &StoreType) -> Type {
    match store_type {
        StoreType::Boolean => Type::BOOL,
        StoreType::SmallInt => Type::INT2,
        StoreType::Integer => Type::INT4,
        StoreType::BigInt => Type::INT8,
        StoreType::Double => Type::FLOAT8,
        StoreType::Text => Type::TEXT,
        StoreType::VarChar(_) => Type::VARCHAR,
        StoreType::Bytes => Type::BYTEA,
        StoreType::Uuid => Type::UUID,
        StoreType::TimestampTz => Type::TIMESTAMPTZ,
        StoreType::Json => Type::JSONB,
    }
}

pub fn create_table_sql(request: &CreateTable) -> String {
    let mut parts: Vec<String> = request
        .columns
        .iter()
        .map(|c| {
            format!(
                "{} {}{}",
                quote_identifier(&c.name),
                sql_type(&c.store_type),
                if c.nullable { "" } else { " NOT NULL" }
            )
        })
        .collect();
    if !request.primary_key.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", quote_list(&request.primary_key)));
    }
    format!(
        "CREATE {}TABLE {} ({})",
        if request.temporary { "TEMPORARY " } else { "" },
        quote_table(&request.table),
        parts.join(", ")
    )
}

pub fn drop_table_sql(table: &TableName) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_table(table))
}

pub fn truncate_table_sql(table: &TableName) -> String {
    format!("TRUNCATE TABLE {}", quote_table(table))
}

pub fn add_primary_key_sql(table: &TableName, columns: &[String]) -> String {
    format!(
        "ALTER TABLE {} ADD PRIMARY KEY ({})",
        quote_table(table),
        quote_list(columns)
    )
}

/// Takes the quoted table name as its only parameter. Temporary tables are
/// found through the session's search path.
pub const TABLE_EXISTS_SQL: &str = "SELECT to_regclass($1) IS NOT NULL";

pub fn copy_in_sql(table: &TableName, columns: &[&str]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN (FORMAT binary)",
        quote_table(table),
        quote_list(columns)
    )
}

pub fn count_rows_sql(table: &TableName) -> String {
    format!("SELECT count(*) FROM {}", quote_table(table))
}

/// Temporary tables are session scoped; pooled sessions outlive a release.
pub const DISCARD_TEMP_SQL: &str = "DISCARD TEMP";

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_storage::TableColumn;

    fn column(name: &str, store_type: StoreType, nullable: bool) -> TableColumn {
        TableColumn {
            name: name.to_string(),
            store_type,
            nullable,
        }
    }

    #[test]
    fn test_quote_identifier_doubles_quotes() {
        assert_eq!(quote_identifier("order"), "\"order\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(
            quote_table(&TableName::with_schema("sales", "orders")),
            "\"sales\".\"orders\""
        );
    }

    #[test]
    fn test_create_temporary_table_with_key() {
        let request = CreateTable::new(
            TableName::new("orders_1"),
            vec![
                column("total", StoreType::BigInt, false),
                column("note", StoreType::VarChar(Some(40)), true),
                column("customer_id", StoreType::Integer, false),
            ],
        )
        .with_primary_key(vec!["customer_id".to_string()])
        .temporary();

        assert_eq!(
            create_table_sql(&request),
            "CREATE TEMPORARY TABLE \"orders_1\" (\"total\" bigint NOT NULL, \
             \"note\" varchar(40), \"customer_id\" integer NOT NULL, \
             PRIMARY KEY (\"customer_id\"))"
        );
    }

    #[test]
    fn test_create_permanent_table_without_key() {
        let request = CreateTable::new(
            TableName::with_schema("sales", "tags"),
            vec![column("label", StoreType::Text, false)],
        );
        assert_eq!(
            create_table_sql(&request),
            "CREATE TABLE \"sales\".\"tags\" (\"label\" text NOT NULL)"
        );
    }

    #[test]
    fn test_statement_texts() {
        let table = TableName::new("customers_2");
        assert_eq!(drop_table_sql(&table), "DROP TABLE IF EXISTS \"customers_2\"");
        assert_eq!(truncate_table_sql(&table), "TRUNCATE TABLE \"customers_2\"");
        assert_eq!(
            add_primary_key_sql(&table, &["tenant_id".to_string(), "user_id".to_string()]),
            "ALTER TABLE \"customers_2\" ADD PRIMARY KEY (\"tenant_id\", \"user_id\")"
        );
        assert_eq!(
            copy_in_sql(&table, &["id", "name"]),
            "COPY \"customers_2\" (\"id\", \"name\") FROM STDIN (FORMAT binary)"
        );
    }

    #[test]
    fn test_type_mapping_is_consistent() {
        let types = [
            StoreType::Boolean,
            StoreType::SmallInt,
            StoreType::Integer,
            StoreType::BigInt,
            StoreType::Double,
            StoreType::Text,
            StoreType::VarChar(None),
            StoreType::Bytes,
            StoreType::Uuid,
            StoreType::TimestampTz,
            StoreType::Json,
        ];
        for store_type in &types {
            let ddl = sql_type(store_type);
            let wire = pg_type(store_type);
            // DDL names and wire type names agree up to aliases
            let alias = match wire.name() {
                "bool" => "boolean",
                "int2" => "smallint",
                "int4" => "integer",
                "int8" => "bigint",
                "float8" => "double precision",
                other => other,
            };
            assert_eq!(ddl, alias, "{:?}", store_type);
        }
    }
}
