//! SQLite-backed deduplicating store for violation reports.

use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use thiserror::Error;

use crate::{
    normalize::{MalformedDocumentUri, NormalizedReport, normalize},
    report::ViolationReportBody,
};

/// Tables and indexes backing the store. Every statement is idempotent.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS blocked_host (
        blh_id          INTEGER NOT NULL PRIMARY KEY,
        blh_hostname    TEXT    NOT NULL,

        UNIQUE(blh_hostname)
    );

    CREATE INDEX IF NOT EXISTS idx_blocked_host_blh_hostname ON blocked_host (blh_hostname);

    CREATE TABLE IF NOT EXISTS blocked_uri (
        blu_id          INTEGER NOT NULL PRIMARY KEY,
        blu_uri         TEXT    NOT NULL,
        blu_host_id     INTEGER NOT NULL REFERENCES blocked_host(blh_id),

        UNIQUE(blu_host_id, blu_uri)
    );

    CREATE INDEX IF NOT EXISTS idx_blocked_uri_blu_uri ON blocked_uri (blu_uri);

    CREATE TABLE IF NOT EXISTS csp_policy (
        csp_id          INTEGER NOT NULL PRIMARY KEY,
        csp_hostname_id INTEGER NOT NULL REFERENCES blocked_host(blh_id),
        csp_policy      TEXT    NOT NULL,

        UNIQUE(csp_policy, csp_hostname_id)
    );

    CREATE TABLE IF NOT EXISTS csp_violated_directive (
        cvd_id              INTEGER NOT NULL PRIMARY KEY,
        cvd_csp_policy_id   INTEGER NOT NULL REFERENCES csp_policy(csp_id),
        cvd_directive       TEXT    NOT NULL,

        UNIQUE(cvd_csp_policy_id, cvd_directive)
    );
";

/// One of the insert-if-absent steps performed by [`ViolationStore::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStep {
    Host,
    Uri,
    Policy,
    Directive,
}

impl std::fmt::Display for StoreStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match *self {
            Self::Host => "hostname",
            Self::Uri => "uri",
            Self::Policy => "policy",
            Self::Directive => "violated directive",
        })
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("could not insert invalid document URI")]
    MalformedDocumentUri(#[from] MalformedDocumentUri),
    #[error("could not begin transaction")]
    Begin(#[source] sqlx::Error),
    #[error("could not insert {step}")]
    Insert {
        step: StoreStep,
        #[source]
        source: sqlx::Error,
    },
    #[error("could not commit transaction")]
    Commit(#[source] sqlx::Error),
}

/// Persists the distinct host, URI, policy and directive of each report.
#[derive(Clone, Debug)]
pub struct ViolationStore {
    pool: SqlitePool,
}

impl ViolationStore {
    /// Connect to the SQLite database at `dsn`, creating the file if it is missing.
    pub async fn open(dsn: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(dsn)
            .context("failed to parse database options")?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .context("failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Create the tables if they do not exist yet.
    pub async fn initialize(&self) -> Result<()> {
        _ = sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to create tables")?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Record the report, inserting each level of the hierarchy only if it is not
    /// already present.
    ///
    /// All four inserts share one transaction. A failure at any step leaves the
    /// database as it was before the call.
    #[tracing::instrument(skip_all, fields(document_uri = %body.document_uri))]
    pub async fn store(&self, body: &ViolationReportBody) -> Result<(), StorageError> {
        let NormalizedReport {
            hostname,
            uri,
            policy,
            directive,
        } = normalize(body)?;

        // Unless committed, the transaction will be automatically rolled back.
        let mut tx = self.pool.begin().await.map_err(StorageError::Begin)?;

        _ = sqlx::query(
            r#"
            INSERT INTO blocked_host (blh_hostname)
                VALUES (?)
                ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&hostname)
        .execute(&mut *tx)
        .await
        .map_err(|source| StorageError::Insert {
            step: StoreStep::Host,
            source,
        })?;

        // Parents are resolved with scalar sub-selects: a missing parent becomes a
        // NULL and fails the NOT NULL constraint instead of inserting nothing.
        _ = sqlx::query(
            r#"
            INSERT INTO blocked_uri (blu_uri, blu_host_id)
                SELECT ?, (SELECT blh_id FROM blocked_host WHERE blh_hostname = ?)
                WHERE true
                ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&uri)
        .bind(&hostname)
        .execute(&mut *tx)
        .await
        .map_err(|source| StorageError::Insert {
            step: StoreStep::Uri,
            source,
        })?;

        _ = sqlx::query(
            r#"
            INSERT INTO csp_policy (csp_policy, csp_hostname_id)
                SELECT ?, (SELECT blh_id FROM blocked_host WHERE blh_hostname = ?)
                WHERE true
                ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&policy)
        .bind(&hostname)
        .execute(&mut *tx)
        .await
        .map_err(|source| StorageError::Insert {
            step: StoreStep::Policy,
            source,
        })?;

        _ = sqlx::query(
            r#"
            INSERT INTO csp_violated_directive (cvd_directive, cvd_csp_policy_id)
                SELECT ?, (
                    SELECT csp_id
                    FROM csp_policy
                    JOIN blocked_host ON blh_id = csp_hostname_id
                    WHERE csp_policy = ? AND blh_hostname = ?
                )
                WHERE true
                ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&directive)
        .bind(&policy)
        .bind(&hostname)
        .execute(&mut *tx)
        .await
        .map_err(|source| StorageError::Insert {
            step: StoreStep::Directive,
            source,
        })?;

        tx.commit().await.map_err(StorageError::Commit)?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;

    use super::*;
    use crate::tests::{TempDir, count_rows, report_body, test_store};

    #[tokio::test]
    async fn store_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let store = test_store(&dir).await?;
        let body = report_body("https://site.test/a", "https://evil.test/x.js");

        store.store(&body).await?;
        let once = count_rows(&store).await?;
        store.store(&body).await?;
        let twice = count_rows(&store).await?;

        assert_eq!(once, [1, 1, 1, 1]);
        assert_eq!(once, twice);

        Ok(())
    }

    #[tokio::test]
    async fn directives_share_policy_and_host() -> Result<()> {
        let dir = TempDir::new()?;
        let store = test_store(&dir).await?;

        let mut body = report_body("https://site.test/a", "https://evil.test/x.js");
        store.store(&body).await?;
        body.violated_directive = "style-src".to_owned();
        store.store(&body).await?;

        assert_eq!(count_rows(&store).await?, [1, 1, 1, 2]);

        let parents: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT DISTINCT csp_id, csp_hostname_id
            FROM csp_violated_directive
            JOIN csp_policy ON csp_id = cvd_csp_policy_id
            "#,
        )
        .fetch_all(store.pool())
        .await?;
        assert_eq!(parents.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn uri_and_policy_are_independent_branches() -> Result<()> {
        let dir = TempDir::new()?;
        let store = test_store(&dir).await?;

        let mut body = report_body("https://site.test/a", "https://evil.test/x.js");
        store.store(&body).await?;
        body.document_uri = "https://site.test/b".to_owned();
        store.store(&body).await?;
        body.original_policy = "default-src 'none'".to_owned();
        store.store(&body).await?;

        // One host, two paths, two policies, one directive under each policy.
        assert_eq!(count_rows(&store).await?, [1, 2, 2, 2]);

        Ok(())
    }

    #[tokio::test]
    async fn same_policy_on_different_hosts() -> Result<()> {
        let dir = TempDir::new()?;
        let store = test_store(&dir).await?;

        store
            .store(&report_body("https://one.test/", "https://evil.test/x.js"))
            .await?;
        store
            .store(&report_body("https://two.test/", "https://evil.test/x.js"))
            .await?;

        assert_eq!(count_rows(&store).await?, [2, 2, 2, 2]);

        Ok(())
    }

    #[tokio::test]
    async fn stores_lower_cased_keys() -> Result<()> {
        let dir = TempDir::new()?;
        let store = test_store(&dir).await?;

        let mut body = report_body("https://Example.COM/Path", "https://evil.test/x.js");
        body.original_policy = "Script-Src 'SELF'".to_owned();
        body.violated_directive = "Script-Src".to_owned();
        store.store(&body).await?;

        let hostname: String = sqlx::query_scalar("SELECT blh_hostname FROM blocked_host")
            .fetch_one(store.pool())
            .await?;
        let uri: String = sqlx::query_scalar("SELECT blu_uri FROM blocked_uri")
            .fetch_one(store.pool())
            .await?;
        let policy: String = sqlx::query_scalar("SELECT csp_policy FROM csp_policy")
            .fetch_one(store.pool())
            .await?;
        let directive: String =
            sqlx::query_scalar("SELECT cvd_directive FROM csp_violated_directive")
                .fetch_one(store.pool())
                .await?;

        assert_eq!(hostname, "example.com");
        assert_eq!(uri, "/path");
        assert_eq!(policy, "script-src 'self'");
        assert_eq!(directive, "script-src");

        // Same keys modulo case do not add rows.
        store
            .store(&report_body("https://example.com/PATH", "https://evil.test/x.js"))
            .await?;
        assert_eq!(count_rows(&store).await?[..2], [1, 1]);

        Ok(())
    }

    #[tokio::test]
    async fn malformed_document_uri_writes_nothing() -> Result<()> {
        let dir = TempDir::new()?;
        let store = test_store(&dir).await?;

        let err = store
            .store(&report_body("http://exa mple.com/", "https://evil.test/x.js"))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::MalformedDocumentUri(_)));
        assert_eq!(count_rows(&store).await?, [0, 0, 0, 0]);

        Ok(())
    }

    #[tokio::test]
    async fn failed_step_rolls_back_earlier_steps() -> Result<()> {
        let dir = TempDir::new()?;
        let store = test_store(&dir).await?;

        _ = sqlx::query(
            r#"
            CREATE TRIGGER reject_directive BEFORE INSERT ON csp_violated_directive
            BEGIN
                SELECT RAISE(ABORT, 'directive rejected');
            END
            "#,
        )
        .execute(store.pool())
        .await?;

        let err = store
            .store(&report_body("https://site.test/a", "https://evil.test/x.js"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StorageError::Insert {
                step: StoreStep::Directive,
                ..
            }
        ));
        assert_eq!(count_rows(&store).await?, [0, 0, 0, 0]);

        Ok(())
    }

    #[tokio::test]
    async fn concurrent_identical_reports() -> Result<()> {
        let dir = TempDir::new()?;
        let store = test_store(&dir).await?;
        let body = report_body("https://site.test/a", "https://evil.test/x.js");

        let results = join_all((0..16).map(|_| {
            let store = store.clone();
            let body = body.clone();
            tokio::spawn(async move { store.store(&body).await })
        }))
        .await;

        for result in results {
            result??;
        }
        assert_eq!(count_rows(&store).await?, [1, 1, 1, 1]);

        Ok(())
    }

    #[tokio::test]
    async fn initialize_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let store = test_store(&dir).await?;

        store
            .store(&report_body("https://site.test/a", "https://evil.test/x.js"))
            .await?;
        store.initialize().await?;

        assert_eq!(count_rows(&store).await?, [1, 1, 1, 1]);

        Ok(())
    }

    #[test]
    fn insert_error_names_the_step() {
        let err = StorageError::Insert {
            step: StoreStep::Directive,
            source: sqlx::Error::RowNotFound,
        };
        assert_eq!(err.to_string(), "could not insert violated directive");
    }
}
