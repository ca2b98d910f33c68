use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use sqlx::error::DatabaseError;
use sqlx::mysql::MySqlDatabaseError;

/// ER_LOCK_WAIT_TIMEOUT
const MYSQL_LOCK_WAIT_TIMEOUT: u16 = 1205;
/// ER_LOCK_DEADLOCK
const MYSQL_DEADLOCK: u16 = 1213;
/// SQLSTATE for a transaction rolled back as a serialization failure.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

fn for_year(tax_year: &Option<i32>) -> String {
    match tax_year {
        Some(year) => format!(" while processing tax year {year}"),
        None => String::new(),
    }
}

/// Server-side MySQL error number, when the failure came from MySQL.
pub(crate) fn mysql_error_number(db_err: &dyn DatabaseError) -> Option<u16> {
    db_err
        .try_downcast_ref::<MySqlDatabaseError>()
        .map(MySqlDatabaseError::number)
}

fn is_contention_number(number: u16) -> bool {
    matches!(number, MYSQL_LOCK_WAIT_TIMEOUT | MYSQL_DEADLOCK)
}

/// Lock waits and deadlocks roll the statement back without side effects.
fn is_lock_contention(db_err: &dyn DatabaseError) -> bool {
    mysql_error_number(db_err).is_some_and(is_contention_number)
        || db_err.code().as_deref() == Some(SQLSTATE_SERIALIZATION_FAILURE)
}

/// What went wrong in the store, phrased for API clients. Never carries SQL
/// text or driver output.
fn describe(err: &sqlx::Error) -> &'static str {
    match err {
        sqlx::Error::Database(_) => "the database rejected the statement",
        sqlx::Error::RowNotFound => "an expected record was missing",
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            "a stored record could not be decoded"
        }
        sqlx::Error::Migrate(_) => "the schema is not up to date",
        _ => "the operation could not be completed",
    }
}

/// Failures of P9 aggregation, storage and rendering.
#[derive(Debug, thiserror::Error)]
pub enum P9Error {
    #[error(
        "no payslips found for employee {employee_id} in tax year {tax_year}; \
         a P9 certificate needs at least one month of payroll data"
    )]
    InsufficientData { employee_id: u64, tax_year: i32 },

    #[error("employee {employee_id} has more than one payslip for month {month} of tax year {tax_year}")]
    DuplicateMonth {
        employee_id: u64,
        tax_year: i32,
        month: u8,
    },

    #[error("payroll data for tax year {tax_year} is inconsistent: {reason}")]
    DataIntegrity { tax_year: i32, reason: String },

    #[error("tax year {0} is outside the supported range")]
    InvalidTaxYear(i32),

    #[error("P9 certificate not found")]
    NotFound,

    #[error("certificate store unavailable{}: {reason}; safe to retry", for_year(.tax_year))]
    StoreUnavailable {
        tax_year: Option<i32>,
        reason: String,
    },

    #[error("certificate store error{}: {source}", for_year(.tax_year))]
    Store {
        tax_year: Option<i32>,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to render the P9 document for tax year {tax_year}: {reason}")]
    DocumentRendering { tax_year: i32, reason: String },

    #[error("{0}")]
    Forbidden(&'static str),
}

pub type P9Result<T> = Result<T, P9Error>;

impl P9Error {
    /// Classifies a database failure. Pool exhaustion, connection faults and
    /// lock contention are transient; everything else is a store fault.
    pub fn from_store(err: sqlx::Error, tax_year: Option<i32>) -> Self {
        let transient = match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => true,
            sqlx::Error::Database(db_err) => is_lock_contention(&**db_err),
            _ => false,
        };

        if transient {
            P9Error::StoreUnavailable {
                tax_year,
                reason: err.to_string(),
            }
        } else {
            P9Error::Store {
                tax_year,
                source: err,
            }
        }
    }

    pub fn tax_year(&self) -> Option<i32> {
        match self {
            P9Error::InsufficientData { tax_year, .. }
            | P9Error::DuplicateMonth { tax_year, .. }
            | P9Error::DataIntegrity { tax_year, .. }
            | P9Error::DocumentRendering { tax_year, .. } => Some(*tax_year),
            P9Error::InvalidTaxYear(year) => Some(*year),
            P9Error::StoreUnavailable { tax_year, .. } | P9Error::Store { tax_year, .. } => *tax_year,
            P9Error::NotFound | P9Error::Forbidden(_) => None,
        }
    }

    /// Stable identifier rendered as `error` in JSON bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            P9Error::InsufficientData { .. } => "insufficient_data",
            P9Error::DuplicateMonth { .. } => "duplicate_month",
            P9Error::DataIntegrity { .. } => "data_integrity",
            P9Error::InvalidTaxYear(_) => "invalid_tax_year",
            P9Error::NotFound => "not_found",
            P9Error::StoreUnavailable { .. } => "store_unavailable",
            P9Error::Store { .. } => "store_error",
            P9Error::DocumentRendering { .. } => "document_rendering",
            P9Error::Forbidden(_) => "forbidden",
        }
    }

    /// Message for the response body. Store faults keep the year and a
    /// readable reason but drop the driver text.
    pub fn public_message(&self) -> String {
        match self {
            P9Error::Store { tax_year, source } => format!(
                "certificate store error{}: {}",
                for_year(tax_year),
                describe(source)
            ),
            other => other.to_string(),
        }
    }

    /// Emits the failure at the level its kind deserves.
    pub fn log(&self, employee_id: u64) {
        match self {
            P9Error::InsufficientData { .. }
            | P9Error::InvalidTaxYear(_)
            | P9Error::NotFound
            | P9Error::Forbidden(_) => {
                tracing::info!(employee_id, error = %self, "P9 request not satisfiable")
            }
            P9Error::DuplicateMonth { .. } | P9Error::DataIntegrity { .. } => {
                tracing::warn!(employee_id, error = %self, "Malformed payroll data")
            }
            P9Error::StoreUnavailable { .. }
            | P9Error::Store { .. }
            | P9Error::DocumentRendering { .. } => {
                tracing::error!(employee_id, error = %self, "P9 operation failed")
            }
        }
    }
}

impl ResponseError for P9Error {
    fn status_code(&self) -> StatusCode {
        match self {
            P9Error::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            P9Error::DuplicateMonth { .. } | P9Error::DataIntegrity { .. } => StatusCode::CONFLICT,
            P9Error::InvalidTaxYear(_) => StatusCode::BAD_REQUEST,
            P9Error::NotFound => StatusCode::NOT_FOUND,
            P9Error::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            P9Error::Store { .. } | P9Error::DocumentRendering { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            P9Error::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.kind(),
            "message": self.public_message(),
            "tax_year": self.tax_year(),
        }))
    }
}
