use std::sync::Once;

use anyhow::Context as _;
use serde_json::Value;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool, Column as _, Row as _, ValueRef as _};

use crate::config::{DatabaseConfig, DatabaseType};
use crate::snapshot::{DbState, Row};

/// Captures and restores database state for the configured tables.
///
/// One implementation covers all three dialects through the sqlx Any driver;
/// the dialect only decides identifier quoting, placeholders, discovery
/// queries, and foreign-key suppression statements.
#[derive(Debug, Clone)]
pub struct Snapshotter {
    pool: AnyPool,
    db_type: DatabaseType,
    configured_tables: Vec<String>,
    namespaces: Vec<String>,
}

impl Snapshotter {
    /// Connects and pings the database; construction fails if the database
    /// is unreachable.
    pub async fn connect(
        config: &DatabaseConfig,
        connection_string: &str,
    ) -> anyhow::Result<Self> {
        static INSTALL_DRIVERS: Once = Once::new();
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let url = normalize_connection_string(config.db_type, connection_string);
        let pool = AnyPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .with_context(|| format!("connect to {} database", db_type_name(config.db_type)))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("ping database")?;

        Ok(Self {
            pool,
            db_type: config.db_type,
            configured_tables: config.tables.clone(),
            namespaces: config.namespaces.clone(),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Returns the configured table list, or discovers tables via the
    /// dialect's catalog query when none are configured.
    pub async fn tables(&self) -> anyhow::Result<Vec<String>> {
        if !self.configured_tables.is_empty() {
            return Ok(self.configured_tables.clone());
        }
        self.discover_tables().await
    }

    /// Reads all rows of a table in natural scan order. Byte values coerce
    /// to strings for human readability.
    pub async fn snapshot_table(&self, table: &str) -> anyhow::Result<Vec<Row>> {
        let query = format!("SELECT * FROM {}", self.quote_identifier(table));
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("query table {table}"))?;

        Ok(rows.iter().map(row_to_map).collect())
    }

    /// Reads every configured table into a single state mapping.
    pub async fn snapshot_all(&self) -> anyhow::Result<DbState> {
        let mut state = DbState::new();
        for table in self.tables().await? {
            let rows = self
                .snapshot_table(&table)
                .await
                .with_context(|| format!("snapshot table {table}"))?;
            state.insert(table, rows);
        }
        Ok(state)
    }

    /// Deletes all rows of a table and inserts the given rows through
    /// parameterized statements. Empty rows are skipped.
    pub async fn restore_table(&self, table: &str, rows: &[Row]) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await.context("acquire connection")?;
        self.restore_table_on(&mut conn, table, rows).await
    }

    /// Restores every table in the state with foreign-key checks suppressed.
    /// Re-enabling the checks is best-effort on all exit paths.
    pub async fn restore_all(&self, state: &DbState) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await.context("acquire connection")?;

        self.set_foreign_key_checks(&mut conn, false)
            .await
            .context("disable foreign key checks")?;

        let mut result = Ok(());
        for (table, rows) in state {
            if let Err(err) = self.restore_table_on(&mut conn, table, rows).await {
                result = Err(err.context(format!("restore table {table}")));
                break;
            }
        }

        if let Err(err) = self.set_foreign_key_checks(&mut conn, true).await {
            tracing::warn!("failed to re-enable foreign key checks: {err}");
        }

        result
    }

    async fn restore_table_on(
        &self,
        conn: &mut PoolConnection<Any>,
        table: &str,
        rows: &[Row],
    ) -> anyhow::Result<()> {
        let quoted = self.quote_identifier(table);

        // DELETE instead of TRUNCATE for cross-dialect compatibility.
        sqlx::query(&format!("DELETE FROM {quoted}"))
            .execute(&mut **conn)
            .await
            .with_context(|| format!("clear table {table}"))?;

        for row in rows {
            if row.is_empty() {
                continue;
            }

            let columns: Vec<String> = row
                .keys()
                .map(|column| self.quote_identifier(column))
                .collect();
            let placeholders: Vec<String> = (0..row.len())
                .map(|index| self.placeholder(index))
                .collect();
            let insert = format!(
                "INSERT INTO {quoted} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            );

            let mut query = sqlx::query(&insert);
            for value in row.values() {
                query = bind_value(query, value);
            }
            query
                .execute(&mut **conn)
                .await
                .with_context(|| format!("insert into {table}"))?;
        }

        Ok(())
    }

    async fn discover_tables(&self) -> anyhow::Result<Vec<String>> {
        match self.db_type {
            DatabaseType::Postgres => {
                if self.namespaces.is_empty() {
                    self.query_strings(
                        "SELECT tablename FROM pg_tables WHERE schemaname = 'public'",
                        &[],
                    )
                    .await
                } else {
                    self.discover_namespaced(
                        "SELECT tablename FROM pg_tables WHERE schemaname = $1",
                    )
                    .await
                }
            }
            DatabaseType::Mysql => {
                if self.namespaces.is_empty() {
                    self.query_strings("SHOW TABLES", &[]).await
                } else {
                    self.discover_namespaced(
                        "SELECT table_name FROM information_schema.tables WHERE table_schema = ?",
                    )
                    .await
                }
            }
            DatabaseType::Sqlite => {
                self.query_strings(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                    &[],
                )
                .await
            }
        }
    }

    /// Discovery across configured namespaces; table names come back
    /// schema-qualified so later quoting addresses the right namespace.
    async fn discover_namespaced(&self, query: &str) -> anyhow::Result<Vec<String>> {
        let mut tables = Vec::new();
        for namespace in &self.namespaces {
            let names = self.query_strings(query, &[namespace]).await?;
            tables.extend(
                names
                    .into_iter()
                    .map(|name| format!("{namespace}.{name}")),
            );
        }
        Ok(tables)
    }

    async fn query_strings(&self, query: &str, params: &[&str]) -> anyhow::Result<Vec<String>> {
        let mut prepared = sqlx::query(query);
        for param in params {
            prepared = prepared.bind((*param).to_owned());
        }
        let rows = prepared
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("run discovery query {query}"))?;

        rows.iter()
            .map(|row| row.try_get::<String, _>(0).context("read table name"))
            .collect()
    }

    async fn set_foreign_key_checks(
        &self,
        conn: &mut PoolConnection<Any>,
        enabled: bool,
    ) -> anyhow::Result<()> {
        let statement = match (self.db_type, enabled) {
            (DatabaseType::Postgres, false) => "SET session_replication_role = 'replica'",
            (DatabaseType::Postgres, true) => "SET session_replication_role = 'origin'",
            (DatabaseType::Mysql, false) => "SET FOREIGN_KEY_CHECKS = 0",
            (DatabaseType::Mysql, true) => "SET FOREIGN_KEY_CHECKS = 1",
            (DatabaseType::Sqlite, false) => "PRAGMA foreign_keys = OFF",
            (DatabaseType::Sqlite, true) => "PRAGMA foreign_keys = ON",
        };
        sqlx::query(statement)
            .execute(&mut **conn)
            .await
            .with_context(|| format!("execute {statement}"))?;
        Ok(())
    }

    /// Quotes an identifier for the dialect; schema-qualified names quote
    /// each segment. Embedded quote characters are doubled.
    fn quote_identifier(&self, name: &str) -> String {
        name.split('.')
            .map(|segment| self.quote_segment(segment))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn quote_segment(&self, segment: &str) -> String {
        match self.db_type {
            DatabaseType::Mysql => format!("`{}`", segment.replace('`', "``")),
            _ => format!("\"{}\"", segment.replace('"', "\"\"")),
        }
    }

    fn placeholder(&self, index: usize) -> String {
        match self.db_type {
            DatabaseType::Postgres => format!("${}", index + 1),
            _ => "?".to_owned(),
        }
    }
}

fn db_type_name(db_type: DatabaseType) -> &'static str {
    match db_type {
        DatabaseType::Postgres => "postgres",
        DatabaseType::Mysql => "mysql",
        DatabaseType::Sqlite => "sqlite",
    }
}

/// Bare sqlite paths gain a `sqlite://` scheme so one connection-string
/// field covers all dialects.
fn normalize_connection_string(db_type: DatabaseType, connection_string: &str) -> String {
    if db_type == DatabaseType::Sqlite && !connection_string.starts_with("sqlite") {
        format!("sqlite://{connection_string}")
    } else {
        connection_string.to_owned()
    }
}

fn row_to_map(row: &AnyRow) -> Row {
    let mut map = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_owned(), column_value(row, index));
    }
    map
}

fn column_value(row: &AnyRow, index: usize) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(_) => {}
        Err(_) => return Value::Null,
    }

    if let Ok(value) = row.try_get::<i64, _>(index) {
        return Value::from(value);
    }
    if let Ok(value) = row.try_get::<f64, _>(index) {
        return Value::from(value);
    }
    if let Ok(value) = row.try_get::<bool, _>(index) {
        return Value::from(value);
    }
    if let Ok(value) = row.try_get::<String, _>(index) {
        return Value::from(value);
    }
    if let Ok(value) = row.try_get::<Vec<u8>, _>(index) {
        return Value::from(String::from_utf8_lossy(&value).into_owned());
    }
    Value::Null
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>>,
    value: &Value,
) -> sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(flag) => query.bind(*flag),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                query.bind(int)
            } else {
                query.bind(number.as_f64().unwrap_or_default())
            }
        }
        Value::String(text) => query.bind(text.clone()),
        other => query.bind(other.to_string()),
    }
}
