//! Transactional session manager
//!
//! Every store operation runs inside a [`DbSession`]: one SQLite transaction
//! opened in read or write mode. Mutating operations require a write session
//! and an explicit `commit()`; a session that goes out of scope while still
//! open is rolled back when the underlying transaction drops, so no code
//! path can leave a transaction open past the caller's scope.

use std::fmt;

use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::error;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Read,
    Write,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Read => f.write_str("read"),
            SessionMode::Write => f.write_str("write"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Open => f.write_str("open"),
            SessionState::Committed => f.write_str("committed"),
            SessionState::RolledBack => f.write_str("rolled back"),
        }
    }
}

/// A scoped database transaction with an explicit state machine.
pub struct DbSession {
    tx: Option<Transaction<'static, Sqlite>>,
    mode: SessionMode,
    state: SessionState,
}

impl DbSession {
    pub async fn begin(pool: &SqlitePool, mode: SessionMode) -> Result<Self> {
        match pool.begin().await {
            Ok(tx) => Ok(Self {
                tx: Some(tx),
                mode,
                state: SessionState::Open,
            }),
            Err(e) => {
                error!(%mode, error = %e, "failed to start database session");
                Err(e.into())
            }
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Executor for statements inside this session.
    ///
    /// Fails with [`Error::SessionState`] naming `operation` unless the
    /// session is still open.
    pub fn conn(&mut self, operation: &str) -> Result<&mut SqliteConnection> {
        if self.state != SessionState::Open {
            error!(operation, state = %self.state, "operation attempted on non-open session");
            return Err(Error::SessionState(format!(
                "Cannot {operation} when session is {}",
                self.state
            )));
        }
        match self.tx.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => Err(Error::SessionState(format!(
                "Cannot {operation} when session is {}",
                self.state
            ))),
        }
    }

    /// Guard for mutating operations: they must run in a write session.
    pub fn require_write(&self, operation: &str) -> Result<()> {
        if self.mode != SessionMode::Write {
            return Err(Error::SessionState(format!(
                "Cannot {operation} in a {} session",
                self.mode
            )));
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        let tx = self.take_open("commit")?;
        match tx.commit().await {
            Ok(()) => {
                self.state = SessionState::Committed;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::RolledBack;
                error!(error = %e, "session commit failed");
                Err(e.into())
            }
        }
    }

    pub async fn rollback(&mut self) -> Result<()> {
        let tx = self.take_open("rollback")?;
        match tx.rollback().await {
            Ok(()) => {
                self.state = SessionState::RolledBack;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::RolledBack;
                error!(error = %e, "session rollback failed");
                Err(e.into())
            }
        }
    }

    fn take_open(&mut self, operation: &str) -> Result<Transaction<'static, Sqlite>> {
        if self.state != SessionState::Open {
            error!(operation, state = %self.state, "terminal transition attempted twice");
            return Err(Error::SessionState(format!(
                "Cannot {operation} when session is {}",
                self.state
            )));
        }
        self.tx.take().ok_or_else(|| {
            Error::SessionState(format!(
                "Cannot {operation} when session is {}",
                self.state
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool");
        sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn commit_persists_writes() {
        let pool = test_pool().await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        sqlx::query("INSERT INTO t (id) VALUES (1)")
            .execute(session.conn("insert").unwrap())
            .await
            .unwrap();
        session.commit().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn dropping_an_open_session_rolls_back() {
        let pool = test_pool().await;

        {
            let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
            sqlx::query("INSERT INTO t (id) VALUES (1)")
                .execute(session.conn("insert").unwrap())
                .await
                .unwrap();
            // no commit
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn operations_fail_after_commit() {
        let pool = test_pool().await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        session.commit().await.unwrap();

        let err = session.conn("insert rows").unwrap_err();
        assert!(matches!(err, Error::SessionState(_)));
        assert!(err.to_string().contains("insert rows"));

        let err = session.commit().await.unwrap_err();
        assert!(matches!(err, Error::SessionState(_)));

        let err = session.rollback().await.unwrap_err();
        assert!(matches!(err, Error::SessionState(_)));
    }

    #[tokio::test]
    async fn rollback_discards_writes_and_closes_session() {
        let pool = test_pool().await;

        let mut session = DbSession::begin(&pool, SessionMode::Write).await.unwrap();
        sqlx::query("INSERT INTO t (id) VALUES (1)")
            .execute(session.conn("insert").unwrap())
            .await
            .unwrap();
        session.rollback().await.unwrap();

        assert!(session.conn("query").is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn read_sessions_reject_write_guard() {
        let pool = test_pool().await;

        let session = DbSession::begin(&pool, SessionMode::Read).await.unwrap();
        let err = session.require_write("insert image").unwrap_err();
        assert!(matches!(err, Error::SessionState(_)));
        assert!(err.to_string().contains("read session"));
    }
}
