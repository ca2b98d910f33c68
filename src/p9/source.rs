use async_trait::async_trait;
use sqlx::MySqlPool;

use crate::model::payslip::Payslip;
use crate::p9::error::{P9Error, P9Result, mysql_error_number};

/// ER_NO_SUCH_TABLE
const MYSQL_NO_SUCH_TABLE: u16 = 1146;
const SQLSTATE_NO_SUCH_TABLE: &str = "42S02";

/// The `employees` table belongs to the HR schema and may not exist yet.
fn is_missing_table(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            mysql_error_number(&**db_err) == Some(MYSQL_NO_SUCH_TABLE)
                || db_err.code().as_deref() == Some(SQLSTATE_NO_SUCH_TABLE)
        }
        _ => false,
    }
}

/// Read access to the payroll subsystem's payslips.
#[async_trait]
pub trait PayslipSource: Send + Sync {
    /// Payslips of one employee for one tax year, ordered by month.
    async fn list_payslips(&self, employee_id: u64, tax_year: i32) -> P9Result<Vec<Payslip>>;

    /// Every payslip of a tax year, ordered by employee then month.
    async fn payslips_for_year(&self, tax_year: i32) -> P9Result<Vec<Payslip>>;

    /// Employees holding at least one payslip in `tax_year`.
    async fn employees_with_payslips(&self, tax_year: i32) -> P9Result<Vec<u64>>;

    async fn employee_name(&self, employee_id: u64) -> P9Result<Option<String>>;
}

pub struct MySqlPayslipSource {
    pool: MySqlPool,
}

impl MySqlPayslipSource {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PayslipSource for MySqlPayslipSource {
    async fn list_payslips(&self, employee_id: u64, tax_year: i32) -> P9Result<Vec<Payslip>> {
        sqlx::query_as::<_, Payslip>(
            r#"
            SELECT id, employee_id, tax_year, month,
                   basic_salary, gross_pay, housing_levy, health_levy,
                   retirement_contribution, total_deductions, chargeable_pay,
                   personal_relief, insurance_relief, paye_tax
            FROM payslips
            WHERE employee_id = ? AND tax_year = ?
            ORDER BY month ASC, id ASC
            "#,
        )
        .bind(employee_id)
        .bind(tax_year)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| P9Error::from_store(e, Some(tax_year)))
    }

    async fn payslips_for_year(&self, tax_year: i32) -> P9Result<Vec<Payslip>> {
        sqlx::query_as::<_, Payslip>(
            r#"
            SELECT id, employee_id, tax_year, month,
                   basic_salary, gross_pay, housing_levy, health_levy,
                   retirement_contribution, total_deductions, chargeable_pay,
                   personal_relief, insurance_relief, paye_tax
            FROM payslips
            WHERE tax_year = ?
            ORDER BY employee_id ASC, month ASC, id ASC
            "#,
        )
        .bind(tax_year)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| P9Error::from_store(e, Some(tax_year)))
    }

    async fn employees_with_payslips(&self, tax_year: i32) -> P9Result<Vec<u64>> {
        sqlx::query_scalar::<_, u64>(
            r#"
            SELECT DISTINCT employee_id
            FROM payslips
            WHERE tax_year = ?
            ORDER BY employee_id
            "#,
        )
        .bind(tax_year)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| P9Error::from_store(e, Some(tax_year)))
    }

    async fn employee_name(&self, employee_id: u64) -> P9Result<Option<String>> {
        let result = sqlx::query_scalar::<_, String>(
            "SELECT CONCAT_WS(' ', first_name, last_name) FROM employees WHERE id = ?",
        )
        .bind(employee_id)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(name) => Ok(name),
            Err(e) if is_missing_table(&e) => {
                tracing::debug!(employee_id, "No employees table, leaving the name blank");
                Ok(None)
            }
            Err(e) => Err(P9Error::from_store(e, None)),
        }
    }
}
