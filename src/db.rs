//! Relational schema and session factory.
//!
//! [`Database`] owns a single connection pool bound to one backend. Sessions
//! are not a distinct type here: `sqlx` pools are cheaply `Clone` and
//! `Send + Sync`, so each worker simply holds its own clone and never shares
//! an in-flight transaction with another worker, which is the spirit of the
//! "thread-local session" rule this crate is ported from.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{PgPool, Row as _, SqlitePool};
use tracing::{debug, info};

use crate::config::{Backend, DatabaseConfig};
use crate::{Error, Result};

#[derive(Clone)]
enum Pool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

/// A connection pool bound to one backend, plus the schema namespace and
/// table-layout variant (default vs. Timescale) it was configured with.
#[derive(Clone)]
pub struct Database {
    pool: Pool,
    backend: Backend,
    schema: Option<String>,
}

/// The four `(id, name)` interning tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    Level,
    Topic,
    Host,
    Subscriber,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Level => "level",
            Table::Topic => "topic",
            Table::Host => "host",
            Table::Subscriber => "subscriber",
        }
    }
}

/// A resolved `(id, name)` row from one of the interning tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub id: i64,
    pub name: String,
}

/// A raw, joined message row as stored in the `message` table.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageRow {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub topic: String,
    pub level: String,
    pub host: String,
    pub text: String,
}

impl Database {
    /// Connects to the backend named by `config`, without running
    /// migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config.url()?;
        let pool = match config.backend {
            // A pool of more than one connection to an in-memory SQLite
            // database hands out separate, unrelated databases; this
            // library is otherwise oblivious to whether `database` names a
            // file or `:memory:`, so it always pins the pool to a single
            // connection rather than special-casing the URL.
            Backend::Sqlite => Pool::Sqlite(
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .connect(&url)
                    .await
                    .map_err(|err| connect_error(&url, err))?,
            ),
            Backend::Postgres | Backend::Timescale => Pool::Postgres(
                PgPool::connect(&url).await.map_err(|err| connect_error(&url, err))?,
            ),
        };
        Ok(Database {
            pool,
            backend: config.backend,
            schema: config.schema.clone(),
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    fn qualify(&self, table: &str) -> String {
        match (&self.schema, &self.pool) {
            (Some(schema), Pool::Postgres(_)) => format!("{schema}.{table}"),
            _ => table.to_string(),
        }
    }

    /// Creates the six tables and their indexes if they do not already
    /// exist. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        match &self.pool {
            Pool::Sqlite(pool) => {
                for statement in sqlite_ddl() {
                    sqlx::query(statement).execute(pool).await?;
                }
            }
            Pool::Postgres(pool) => {
                if let Some(schema) = &self.schema {
                    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
                        .execute(pool)
                        .await?;
                }
                for statement in postgres_ddl(self.backend, self.schema.as_deref()) {
                    sqlx::query(&statement).execute(pool).await?;
                }
                if self.backend == Backend::Timescale {
                    let message = self.qualify("message");
                    let result = sqlx::query(&format!(
                        "SELECT create_hypertable('{message}', 'time', if_not_exists => TRUE)"
                    ))
                    .execute(pool)
                    .await;
                    match result {
                        Ok(_) => info!(table = %message, "created hypertable"),
                        Err(err) => {
                            debug!(%err, "create_hypertable failed (timescaledb extension missing?)")
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Looks up an `(id, name)` row by its unique name.
    pub async fn find_by_name(&self, table: Table, name: &str) -> Result<Option<Row>> {
        let table_name = self.qualify(table.name());
        match &self.pool {
            Pool::Sqlite(pool) => {
                let row = sqlx::query(&format!("SELECT id, name FROM {table_name} WHERE name = ?"))
                    .bind(name)
                    .fetch_optional(pool)
                    .await?;
                Ok(row.map(|row| Row {
                    id: row.get::<i64, _>("id"),
                    name: row.get::<String, _>("name"),
                }))
            }
            Pool::Postgres(pool) => {
                let row =
                    sqlx::query(&format!("SELECT id, name FROM {table_name} WHERE name = $1"))
                        .bind(name)
                        .fetch_optional(pool)
                        .await?;
                Ok(row.map(|row| Row {
                    id: row.get::<i64, _>("id"),
                    name: row.get::<String, _>("name"),
                }))
            }
        }
    }

    /// Inserts a new `(name)` row, returning its assigned id. Returns
    /// `Ok(None)` (rather than an error) when a concurrent insert raced us
    /// and violated the unique constraint — callers should retry
    /// [`Database::find_by_name`].
    pub async fn try_insert_name(&self, table: Table, name: &str) -> Result<Option<Row>> {
        let table_name = self.qualify(table.name());
        let result = match &self.pool {
            Pool::Sqlite(pool) => {
                sqlx::query(&format!(
                    "INSERT INTO {table_name} (name) VALUES (?) RETURNING id"
                ))
                .bind(name)
                .fetch_one(pool)
                .await
            }
            Pool::Postgres(pool) => {
                sqlx::query(&format!(
                    "INSERT INTO {table_name} (name) VALUES ($1) RETURNING id"
                ))
                .bind(name)
                .fetch_one(pool)
                .await
            }
        };

        match result {
            Ok(row) => Ok(Some(Row {
                id: row.get::<i64, _>("id"),
                name: name.to_string(),
            })),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Inserts a batch of messages in a single transaction.
    pub async fn insert_messages(
        &self,
        messages: &[(DateTime<Utc>, i64, i64, i64, String)],
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let message_table = self.qualify("message");
        match &self.pool {
            Pool::Sqlite(pool) => {
                let mut tx = pool.begin().await?;
                for (time, topic_id, level_id, host_id, text) in messages {
                    sqlx::query(&format!(
                        "INSERT INTO {message_table} (time, topic_id, level_id, host_id, text) \
                         VALUES (?, ?, ?, ?, ?)"
                    ))
                    .bind(time)
                    .bind(topic_id)
                    .bind(level_id)
                    .bind(host_id)
                    .bind(text)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
            }
            Pool::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                for (time, topic_id, level_id, host_id, text) in messages {
                    sqlx::query(&format!(
                        "INSERT INTO {message_table} (time, topic_id, level_id, host_id, text) \
                         VALUES ($1, $2, $3, $4, $5)"
                    ))
                    .bind(time)
                    .bind(topic_id)
                    .bind(level_id)
                    .bind(host_id)
                    .bind(text)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
            }
        }
        Ok(())
    }

    /// Returns up to `limit` messages on `topic_id` strictly after `after`,
    /// ordered by `time` ascending, with topic/level/host names eagerly
    /// joined in.
    pub async fn fetch_messages(
        &self,
        topic_id: i64,
        after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MessageRow>> {
        let message = self.qualify("message");
        let topic = self.qualify("topic");
        let level = self.qualify("level");
        let host = self.qualify("host");
        let select = format!(
            "SELECT m.id as id, m.time as time, t.name as topic, l.name as level, \
             h.name as host, m.text as text \
             FROM {message} m \
             JOIN {topic} t ON m.topic_id = t.id \
             JOIN {level} l ON m.level_id = l.id \
             JOIN {host} h ON m.host_id = h.id \
             WHERE m.topic_id = {ph1} AND m.time > {ph2} \
             ORDER BY m.time ASC LIMIT {ph3}",
            ph1 = self.placeholder(1),
            ph2 = self.placeholder(2),
            ph3 = self.placeholder(3),
        );

        let rows = match &self.pool {
            Pool::Sqlite(pool) => {
                sqlx::query(&select)
                    .bind(topic_id)
                    .bind(after)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?
            }
            Pool::Postgres(pool) => {
                sqlx::query(&select)
                    .bind(topic_id)
                    .bind(after)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|row| MessageRow {
                id: row.get::<i64, _>("id"),
                time: row.get::<DateTime<Utc>, _>("time"),
                topic: row.get::<String, _>("topic"),
                level: row.get::<String, _>("level"),
                host: row.get::<String, _>("host"),
                text: row.get::<String, _>("text"),
            })
            .collect())
    }

    /// Returns the `time` of the earliest message on `topic_id`, if any.
    pub async fn earliest_message_time(&self, topic_id: i64) -> Result<Option<DateTime<Utc>>> {
        let message = self.qualify("message");
        let select = format!(
            "SELECT time FROM {message} WHERE topic_id = {ph} ORDER BY time ASC LIMIT 1",
            ph = self.placeholder(1),
        );
        let row = match &self.pool {
            Pool::Sqlite(pool) => sqlx::query(&select).bind(topic_id).fetch_optional(pool).await?,
            Pool::Postgres(pool) => {
                sqlx::query(&select).bind(topic_id).fetch_optional(pool).await?
            }
        };
        Ok(row.map(|row| row.get::<DateTime<Utc>, _>("time")))
    }

    /// Fetches the current access cursor for `(subscriber_id, topic_id)`.
    pub async fn find_access(
        &self,
        subscriber_id: i64,
        topic_id: i64,
    ) -> Result<Option<DateTime<Utc>>> {
        let access = self.qualify("access");
        let select = format!(
            "SELECT time FROM {access} WHERE subscriber_id = {ph1} AND topic_id = {ph2}",
            ph1 = self.placeholder(1),
            ph2 = self.placeholder(2),
        );
        let row = match &self.pool {
            Pool::Sqlite(pool) => {
                sqlx::query(&select)
                    .bind(subscriber_id)
                    .bind(topic_id)
                    .fetch_optional(pool)
                    .await?
            }
            Pool::Postgres(pool) => {
                sqlx::query(&select)
                    .bind(subscriber_id)
                    .bind(topic_id)
                    .fetch_optional(pool)
                    .await?
            }
        };
        Ok(row.map(|row| row.get::<DateTime<Utc>, _>("time")))
    }

    /// Inserts a brand-new access cursor. Returns `Ok(false)` (rather than
    /// an error) if a concurrent caller already created one.
    pub async fn try_insert_access(
        &self,
        subscriber_id: i64,
        topic_id: i64,
        time: DateTime<Utc>,
    ) -> Result<bool> {
        let access = self.qualify("access");
        let insert = match &self.pool {
            Pool::Sqlite(_) => format!(
                "INSERT INTO {access} (subscriber_id, topic_id, time) VALUES (?, ?, ?)"
            ),
            Pool::Postgres(_) => format!(
                "INSERT INTO {access} (subscriber_id, topic_id, time) VALUES ($1, $2, $3)"
            ),
        };
        let result = match &self.pool {
            Pool::Sqlite(pool) => {
                sqlx::query(&insert)
                    .bind(subscriber_id)
                    .bind(topic_id)
                    .bind(time)
                    .execute(pool)
                    .await
            }
            Pool::Postgres(pool) => {
                sqlx::query(&insert)
                    .bind(subscriber_id)
                    .bind(topic_id)
                    .bind(time)
                    .execute(pool)
                    .await
            }
        };
        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Upserts the access cursor to `time`.
    pub async fn upsert_access(
        &self,
        subscriber_id: i64,
        topic_id: i64,
        time: DateTime<Utc>,
    ) -> Result<()> {
        let access = self.qualify("access");
        match &self.pool {
            Pool::Sqlite(pool) => {
                sqlx::query(&format!(
                    "INSERT INTO {access} (subscriber_id, topic_id, time) VALUES (?, ?, ?) \
                     ON CONFLICT(subscriber_id, topic_id) DO UPDATE SET time = excluded.time"
                ))
                .bind(subscriber_id)
                .bind(topic_id)
                .bind(time)
                .execute(pool)
                .await?;
            }
            Pool::Postgres(pool) => {
                sqlx::query(&format!(
                    "INSERT INTO {access} (subscriber_id, topic_id, time) VALUES ($1, $2, $3) \
                     ON CONFLICT(subscriber_id, topic_id) DO UPDATE SET time = excluded.time"
                ))
                .bind(subscriber_id)
                .bind(topic_id)
                .bind(time)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Returns every existing topic name matching `root` itself or
    /// `root + sep + *`.
    pub async fn topics_under(&self, root: &str, sep: char) -> Result<Vec<String>> {
        let topic = self.qualify("topic");
        let prefix = format!("{root}{sep}");
        let like_pattern = format!("{}%", escape_like(&prefix));
        let select = format!(
            "SELECT name FROM {topic} WHERE name = {ph1} OR name LIKE {ph2} ESCAPE '\\'",
            ph1 = self.placeholder(1),
            ph2 = self.placeholder(2),
        );
        let rows = match &self.pool {
            Pool::Sqlite(pool) => {
                sqlx::query(&select)
                    .bind(root)
                    .bind(like_pattern)
                    .fetch_all(pool)
                    .await?
            }
            Pool::Postgres(pool) => {
                sqlx::query(&select)
                    .bind(root)
                    .bind(like_pattern)
                    .fetch_all(pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(|row| row.get::<String, _>("name")).collect())
    }

    fn placeholder(&self, index: usize) -> String {
        match &self.pool {
            Pool::Sqlite(_) => "?".to_string(),
            Pool::Postgres(_) => format!("${index}"),
        }
    }
}

/// Maps a connection failure to `Error::Config` only when it is a
/// structurally bad URL/config (`sqlx::Error::Configuration`); every other
/// driver-level failure (auth rejected, host unreachable, TLS, ...) is a
/// `StorageError` a caller should retry, not a fatal config error.
fn connect_error(url: &str, err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::Configuration(source) => Error::config(format!("bad URL {url}: {source}")),
        other => Error::Storage(other),
    }
}

fn escape_like(value: &str) -> String {
    value.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn sqlite_ddl() -> Vec<&'static str> {
    vec![
        "CREATE TABLE IF NOT EXISTS level (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT UNIQUE NOT NULL)",
        "CREATE TABLE IF NOT EXISTS topic (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT UNIQUE NOT NULL)",
        "CREATE TABLE IF NOT EXISTS host (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT UNIQUE NOT NULL)",
        "CREATE TABLE IF NOT EXISTS subscriber (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT UNIQUE NOT NULL)",
        "CREATE TABLE IF NOT EXISTS message (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            time TIMESTAMP NOT NULL,
            topic_id INTEGER NOT NULL REFERENCES topic(id),
            level_id INTEGER NOT NULL REFERENCES level(id),
            host_id INTEGER NOT NULL REFERENCES host(id),
            text TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS message_time_topic_index ON message(time, topic_id)",
        "CREATE INDEX IF NOT EXISTS message_level_index ON message(level_id)",
        "CREATE INDEX IF NOT EXISTS message_host_index ON message(host_id)",
        "CREATE TABLE IF NOT EXISTS access (
            subscriber_id INTEGER NOT NULL REFERENCES subscriber(id),
            topic_id INTEGER NOT NULL REFERENCES topic(id),
            time TIMESTAMP NOT NULL,
            PRIMARY KEY (subscriber_id, topic_id)
        )",
    ]
}

fn postgres_ddl(backend: Backend, schema: Option<&str>) -> Vec<String> {
    let qualify = |table: &str| match schema {
        Some(schema) => format!("{schema}.{table}"),
        None => table.to_string(),
    };

    let mut statements = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {} (id SERIAL PRIMARY KEY, name TEXT UNIQUE NOT NULL)",
            qualify("level")
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (id SERIAL PRIMARY KEY, name TEXT UNIQUE NOT NULL)",
            qualify("topic")
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (id SERIAL PRIMARY KEY, name TEXT UNIQUE NOT NULL)",
            qualify("host")
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (id SERIAL PRIMARY KEY, name TEXT UNIQUE NOT NULL)",
            qualify("subscriber")
        ),
    ];

    if backend == Backend::Timescale {
        statements.push(format!(
            "CREATE SEQUENCE IF NOT EXISTS {}",
            qualify("message_id_seq")
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGINT NOT NULL DEFAULT nextval('{}') CHECK (id > 0),
                time TIMESTAMPTZ NOT NULL,
                topic_id INTEGER NOT NULL,
                level_id INTEGER NOT NULL REFERENCES {}(id),
                host_id INTEGER NOT NULL REFERENCES {}(id),
                text TEXT NOT NULL,
                PRIMARY KEY (time, topic_id)
            )",
            qualify("message"),
            qualify("message_id_seq"),
            qualify("level"),
            qualify("host"),
        ));
        statements.push(format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS message_id_index ON {} (id)",
            qualify("message")
        ));
    } else {
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                time TIMESTAMPTZ NOT NULL,
                topic_id INTEGER NOT NULL REFERENCES {}(id),
                level_id INTEGER NOT NULL REFERENCES {}(id),
                host_id INTEGER NOT NULL REFERENCES {}(id),
                text TEXT NOT NULL
            )",
            qualify("message"),
            qualify("topic"),
            qualify("level"),
            qualify("host"),
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS message_time_topic_index ON {} (time, topic_id)",
            qualify("message")
        ));
    }

    statements.push(format!(
        "CREATE INDEX IF NOT EXISTS message_level_index ON {} (level_id)",
        qualify("message")
    ));
    statements.push(format!(
        "CREATE INDEX IF NOT EXISTS message_host_index ON {} (host_id)",
        qualify("message")
    ));

    statements.push(format!(
        "CREATE TABLE IF NOT EXISTS {} (
            subscriber_id INTEGER NOT NULL REFERENCES {}(id),
            topic_id INTEGER NOT NULL REFERENCES {}(id),
            time TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (subscriber_id, topic_id)
        )",
        qualify("access"),
        qualify("subscriber"),
        qualify("topic"),
    ));

    statements
}
