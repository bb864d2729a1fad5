//! Unit-of-work helper.
//!
//! [`execute_transaction`] runs a piece of work inside one backend
//! transaction. The transaction is committed when the work succeeds and
//! rolled back when it fails, so the work never has to finish it itself.

use std::future::Future;

use tracing_error::SpanTrace;

/// A backend able to open transactions.
#[async_trait::async_trait]
pub trait Transactional: Send + Sync {
    /// An open transaction owned by the caller.
    type Transaction: Send;

    async fn begin(&self) -> Result<Self::Transaction, tower::BoxError>;

    async fn commit(&self, tx: Self::Transaction) -> Result<(), tower::BoxError>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), tower::BoxError>;
}

#[cfg(feature = "sqlx")]
#[async_trait::async_trait]
impl Transactional for sqlx::PgPool {
    type Transaction = sqlx::Transaction<'static, sqlx::Postgres>;

    async fn begin(&self) -> Result<Self::Transaction, tower::BoxError> {
        Ok(sqlx::PgPool::begin(self).await?)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), tower::BoxError> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), tower::BoxError> {
        Ok(tx.rollback().await?)
    }
}

/// Run `work` in a new transaction.
///
/// The work receives the open transaction and hands it back together with its
/// result. An `Ok` result commits, an `Err` result rolls back and is returned
/// unchanged. Rollback failures are logged since the original error is the
/// one worth reporting.
#[tracing::instrument(skip_all)]
pub async fn execute_transaction<D, F, Fut, T, E>(db: &D, work: F) -> Result<T, E>
where
    D: Transactional + ?Sized,
    F: FnOnce(D::Transaction) -> Fut,
    Fut: Future<Output = (D::Transaction, Result<T, E>)>,
    E: From<TransactionError>,
{
    let tx = db.begin().await.map_err(TransactionError::begin)?;
    let (tx, result) = work(tx).await;
    match result {
        Ok(value) => {
            db.commit(tx).await.map_err(TransactionError::commit)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(error) = db.rollback(tx).await {
                tracing::error!(?error, "Transaction rollback failed");
            }
            Err(err)
        }
    }
}

/// Error returned when a transaction could not be opened or committed.
#[derive(Debug)]
pub struct TransactionError {
    context: SpanTrace,
    kind: TransactionErrorKind,
}

/// Transaction phase that failed.
#[derive(Debug)]
pub enum TransactionErrorKind {
    Begin(tower::BoxError),
    Commit(tower::BoxError),
}

impl TransactionError {
    fn begin(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransactionErrorKind::Begin(err),
        }
    }

    fn commit(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransactionErrorKind::Commit(err),
        }
    }

    pub fn kind(&self) -> &TransactionErrorKind {
        &self.kind
    }

    /// The backend error behind the failed phase.
    pub fn into_source(self) -> tower::BoxError {
        match self.kind {
            TransactionErrorKind::Begin(err) | TransactionErrorKind::Commit(err) => err,
        }
    }
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransactionErrorKind::Begin(err) => writeln!(f, "Could not begin transaction: {err}"),
            TransactionErrorKind::Commit(err) => {
                writeln!(f, "Could not commit transaction: {err}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransactionErrorKind::Begin(err) | TransactionErrorKind::Commit(err) => {
                Some(err.as_ref())
            }
        }
    }
}
