use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use sqlx::mysql::{MySql, MySqlArguments};
use sqlx::query::Query;
use sqlx::{MySqlPool, QueryBuilder, Transaction};
use utoipa::ToSchema;

use crate::model::p9::{MonthlyRow, NewCertificate, P9Certificate, P9CertificateSummary};
use crate::model::payslip::PayAmounts;
use crate::p9::aggregate::ensure_reconciled;
use crate::p9::error::{P9Error, P9Result};

macro_rules! amount_columns {
    () => {
        "basic_salary, gross_pay, housing_levy, health_levy, retirement_contribution, \
         total_deductions, chargeable_pay, personal_relief, insurance_relief, paye_tax"
    };
}

macro_rules! certificate_columns {
    () => {
        concat!(
            "id, employee_id, tax_year, payslip_count, ",
            amount_columns!(),
            ", generated_by, generated_at"
        )
    };
}

/// Result of a create-or-fetch attempt.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(P9Certificate),
    AlreadyExisted(P9Certificate),
    /// Another writer committed the same (employee, year) between our read
    /// and our insert. Nothing was written.
    Conflict,
}

#[derive(Debug, Clone, Default)]
pub struct CertificateFilter {
    pub employee_id: Option<u64>,
    pub tax_year: Option<i32>,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CertificatePage {
    pub data: Vec<P9CertificateSummary>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
}

/// Persistence of P9 certificates with their monthly rows.
///
/// Implementations must keep at most one certificate per (employee, year)
/// and write a certificate and its rows as a unit.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn find(&self, employee_id: u64, tax_year: i32) -> P9Result<Option<P9Certificate>>;

    async fn find_by_id(&self, id: u64) -> P9Result<Option<P9Certificate>>;

    async fn list(&self, filter: &CertificateFilter) -> P9Result<CertificatePage>;

    /// Every certificate of a tax year with its rows, by employee.
    async fn for_year(&self, tax_year: i32) -> P9Result<Vec<P9Certificate>>;

    /// Inserts certificate and rows atomically. `None` when the
    /// (employee, year) key is already taken.
    async fn insert(&self, new: &NewCertificate) -> P9Result<Option<P9Certificate>>;

    /// Deletes any existing certificate for the key and inserts `new`, in
    /// one transaction.
    async fn replace(&self, new: &NewCertificate) -> P9Result<P9Certificate>;

    /// Returns the stored certificate untouched if there is one, otherwise
    /// writes `new`.
    async fn get_or_create(&self, new: &NewCertificate) -> P9Result<CreateOutcome> {
        let aggregate = &new.aggregate;
        if let Some(existing) = self.find(aggregate.employee_id, aggregate.tax_year).await? {
            return Ok(CreateOutcome::AlreadyExisted(existing));
        }

        ensure_reconciled(aggregate)?;

        Ok(match self.insert(new).await? {
            Some(created) => CreateOutcome::Created(created),
            None => CreateOutcome::Conflict,
        })
    }

    /// Explicit replacement of a filed certificate.
    async fn regenerate(&self, new: &NewCertificate) -> P9Result<P9Certificate> {
        ensure_reconciled(&new.aggregate)?;
        self.replace(new).await
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn bind_amounts<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    amounts: &PayAmounts,
) -> Query<'q, MySql, MySqlArguments> {
    query
        .bind(amounts.basic_salary)
        .bind(amounts.gross_pay)
        .bind(amounts.housing_levy)
        .bind(amounts.health_levy)
        .bind(amounts.retirement_contribution)
        .bind(amounts.total_deductions)
        .bind(amounts.chargeable_pay)
        .bind(amounts.personal_relief)
        .bind(amounts.insurance_relief)
        .bind(amounts.paye_tax)
}

/// Rows to skip before `page`. Wide enough that no page number overflows.
pub(crate) fn page_offset(page: u32, per_page: u32) -> u64 {
    u64::from(page.saturating_sub(1)) * u64::from(per_page)
}

fn push_filters(builder: &mut QueryBuilder<'_, MySql>, filter: &CertificateFilter) {
    if let Some(employee_id) = filter.employee_id {
        builder.push(" AND employee_id = ").push_bind(employee_id);
    }
    if let Some(tax_year) = filter.tax_year {
        builder.push(" AND tax_year = ").push_bind(tax_year);
    }
}

#[derive(sqlx::FromRow)]
struct BreakdownRow {
    certificate_id: u64,
    #[sqlx(flatten)]
    row: MonthlyRow,
}

pub struct MySqlCertificateStore {
    pool: MySqlPool,
}

impl MySqlCertificateStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn load_rows(&self, certificate_id: u64, tax_year: i32) -> P9Result<Vec<MonthlyRow>> {
        sqlx::query_as::<_, MonthlyRow>(concat!(
            "SELECT month, ",
            amount_columns!(),
            " FROM p9_monthly_breakdowns WHERE certificate_id = ? ORDER BY month ASC"
        ))
        .bind(certificate_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| P9Error::from_store(e, Some(tax_year)))
    }

    async fn with_rows(&self, header: Option<P9CertificateSummary>) -> P9Result<Option<P9Certificate>> {
        match header {
            Some(header) => {
                let rows = self.load_rows(header.id, header.tax_year).await?;
                Ok(Some(header.with_rows(rows)))
            }
            None => Ok(None),
        }
    }

    /// Writes the header and every monthly row inside `tx`.
    async fn insert_in(
        tx: &mut Transaction<'_, MySql>,
        new: &NewCertificate,
    ) -> Result<u64, sqlx::Error> {
        let aggregate = &new.aggregate;

        let query = sqlx::query(concat!(
            "INSERT INTO p9_certificates (employee_id, tax_year, payslip_count, ",
            amount_columns!(),
            ", generated_by, generated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(aggregate.employee_id)
        .bind(aggregate.tax_year)
        .bind(aggregate.payslip_count);

        let result = bind_amounts(query, &aggregate.totals)
            .bind(new.generated_by)
            .bind(new.generated_at)
            .execute(&mut **tx)
            .await?;

        let certificate_id = result.last_insert_id();

        if !aggregate.monthly_rows.is_empty() {
            let mut builder: QueryBuilder<MySql> = QueryBuilder::new(concat!(
                "INSERT INTO p9_monthly_breakdowns (certificate_id, month, ",
                amount_columns!(),
                ") "
            ));
            builder.push_values(&aggregate.monthly_rows, |mut b, row| {
                let a = &row.amounts;
                b.push_bind(certificate_id)
                    .push_bind(row.month)
                    .push_bind(a.basic_salary)
                    .push_bind(a.gross_pay)
                    .push_bind(a.housing_levy)
                    .push_bind(a.health_levy)
                    .push_bind(a.retirement_contribution)
                    .push_bind(a.total_deductions)
                    .push_bind(a.chargeable_pay)
                    .push_bind(a.personal_relief)
                    .push_bind(a.insurance_relief)
                    .push_bind(a.paye_tax);
            });
            builder.build().execute(&mut **tx).await?;
        }

        Ok(certificate_id)
    }
}

#[async_trait]
impl CertificateStore for MySqlCertificateStore {
    async fn find(&self, employee_id: u64, tax_year: i32) -> P9Result<Option<P9Certificate>> {
        let header = sqlx::query_as::<_, P9CertificateSummary>(concat!(
            "SELECT ",
            certificate_columns!(),
            " FROM p9_certificates WHERE employee_id = ? AND tax_year = ?"
        ))
        .bind(employee_id)
        .bind(tax_year)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| P9Error::from_store(e, Some(tax_year)))?;

        self.with_rows(header).await
    }

    async fn find_by_id(&self, id: u64) -> P9Result<Option<P9Certificate>> {
        let header = sqlx::query_as::<_, P9CertificateSummary>(concat!(
            "SELECT ",
            certificate_columns!(),
            " FROM p9_certificates WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| P9Error::from_store(e, None))?;

        self.with_rows(header).await
    }

    async fn list(&self, filter: &CertificateFilter) -> P9Result<CertificatePage> {
        let page = filter.page.max(1);
        let per_page = filter.per_page.clamp(1, 100);
        let offset = page_offset(page, per_page);

        let mut count = QueryBuilder::<MySql>::new("SELECT COUNT(*) FROM p9_certificates WHERE 1 = 1");
        push_filters(&mut count, filter);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| P9Error::from_store(e, filter.tax_year))?;

        let mut select = QueryBuilder::<MySql>::new(concat!(
            "SELECT ",
            certificate_columns!(),
            " FROM p9_certificates WHERE 1 = 1"
        ));
        push_filters(&mut select, filter);
        select
            .push(" ORDER BY tax_year DESC, employee_id ASC LIMIT ")
            .push_bind(per_page)
            .push(" OFFSET ")
            .push_bind(offset);

        let data = select
            .build_query_as::<P9CertificateSummary>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| P9Error::from_store(e, filter.tax_year))?;

        Ok(CertificatePage {
            data,
            page,
            per_page,
            total,
        })
    }

    async fn for_year(&self, tax_year: i32) -> P9Result<Vec<P9Certificate>> {
        let headers = sqlx::query_as::<_, P9CertificateSummary>(concat!(
            "SELECT ",
            certificate_columns!(),
            " FROM p9_certificates WHERE tax_year = ? ORDER BY employee_id ASC"
        ))
        .bind(tax_year)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| P9Error::from_store(e, Some(tax_year)))?;

        let breakdowns = sqlx::query_as::<_, BreakdownRow>(concat!(
            "SELECT b.certificate_id, b.month, ",
            "b.basic_salary, b.gross_pay, b.housing_levy, b.health_levy, b.retirement_contribution, ",
            "b.total_deductions, b.chargeable_pay, b.personal_relief, b.insurance_relief, b.paye_tax ",
            "FROM p9_monthly_breakdowns b JOIN p9_certificates c ON c.id = b.certificate_id ",
            "WHERE c.tax_year = ? ORDER BY b.certificate_id ASC, b.month ASC"
        ))
        .bind(tax_year)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| P9Error::from_store(e, Some(tax_year)))?;

        let mut rows: HashMap<u64, Vec<MonthlyRow>> = HashMap::new();
        for breakdown in breakdowns {
            rows.entry(breakdown.certificate_id)
                .or_default()
                .push(breakdown.row);
        }

        Ok(headers
            .into_iter()
            .map(|header| {
                let monthly = rows.remove(&header.id).unwrap_or_default();
                header.with_rows(monthly)
            })
            .collect())
    }

    async fn insert(&self, new: &NewCertificate) -> P9Result<Option<P9Certificate>> {
        let tax_year = new.aggregate.tax_year;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| P9Error::from_store(e, Some(tax_year)))?;

        let certificate_id = match Self::insert_in(&mut tx, new).await {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!(
                    employee_id = new.aggregate.employee_id,
                    tax_year,
                    "P9 certificate key already taken"
                );
                tx.rollback()
                    .await
                    .map_err(|e| P9Error::from_store(e, Some(tax_year)))?;
                return Ok(None);
            }
            Err(e) => return Err(P9Error::from_store(e, Some(tax_year))),
        };

        tx.commit()
            .await
            .map_err(|e| P9Error::from_store(e, Some(tax_year)))?;

        Ok(Some(new.clone().into_certificate(certificate_id)))
    }

    async fn replace(&self, new: &NewCertificate) -> P9Result<P9Certificate> {
        let employee_id = new.aggregate.employee_id;
        let tax_year = new.aggregate.tax_year;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| P9Error::from_store(e, Some(tax_year)))?;

        // monthly rows go with the parent (ON DELETE CASCADE)
        sqlx::query("DELETE FROM p9_certificates WHERE employee_id = ? AND tax_year = ?")
            .bind(employee_id)
            .bind(tax_year)
            .execute(&mut *tx)
            .await
            .map_err(|e| P9Error::from_store(e, Some(tax_year)))?;

        let certificate_id = match Self::insert_in(&mut tx, new).await {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                return Err(P9Error::StoreUnavailable {
                    tax_year: Some(tax_year),
                    reason: "another generation for this employee committed concurrently".into(),
                });
            }
            Err(e) => return Err(P9Error::from_store(e, Some(tax_year))),
        };

        tx.commit()
            .await
            .map_err(|e| P9Error::from_store(e, Some(tax_year)))?;

        Ok(new.clone().into_certificate(certificate_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p9::aggregate::aggregate;
    use crate::p9::aggregate::tests::payslip;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[test]
    fn offset_of_the_last_page_number_does_not_wrap() {
        assert_eq!(page_offset(1, 10), 0);
        assert_eq!(page_offset(3, 10), 20);
        assert_eq!(page_offset(0, 10), 0);
        assert_eq!(page_offset(u32::MAX, 100), u64::from(u32::MAX - 1) * 100);
    }

    fn new_certificate(employee_id: u64, tax_year: i32, months: &[u8], generated_by: u64) -> NewCertificate {
        let payslips: Vec<_> = months
            .iter()
            .map(|&m| payslip(employee_id, tax_year, m, dec!(40000) + Decimal::from(m)))
            .collect();
        NewCertificate {
            aggregate: aggregate(&payslips, employee_id, tax_year).unwrap(),
            generated_by: Some(generated_by),
            generated_at: Utc.with_ymd_and_hms(2025, 1, 15, 8, 30, 0).unwrap(),
        }
    }

    async fn breakdown_count(pool: &MySqlPool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM p9_monthly_breakdowns")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    // These need DATABASE_URL to point at a MySQL server where the test user
    // may create databases; run them with `cargo test -- --ignored`.

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a MySQL server at DATABASE_URL"]
    async fn second_insert_for_a_key_is_refused_and_leaves_no_rows(pool: MySqlPool) {
        let store = MySqlCertificateStore::new(pool.clone());

        let first = store
            .insert(&new_certificate(1, 2024, &[1, 2, 3], 9))
            .await
            .unwrap()
            .expect("first insert takes the key");
        let second = store
            .insert(&new_certificate(1, 2024, &[1, 2, 3, 4, 5], 10))
            .await
            .unwrap();

        assert!(second.is_none());
        assert_eq!(breakdown_count(&pool).await, 3);
        let stored = store.find(1, 2024).await.unwrap().unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.generated_by, Some(9));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a MySQL server at DATABASE_URL"]
    async fn stored_certificate_reads_back_with_ordered_rows(pool: MySqlPool) {
        let store = MySqlCertificateStore::new(pool.clone());
        let created = store
            .insert(&new_certificate(4, 2023, &[3, 1, 2], 1))
            .await
            .unwrap()
            .unwrap();

        let by_key = store.find(4, 2023).await.unwrap().unwrap();
        let by_id = store.find_by_id(created.id).await.unwrap().unwrap();

        assert_eq!(by_key, created);
        assert_eq!(by_id, created);
        let months: Vec<u8> = by_key.monthly_breakdown.iter().map(|r| r.month).collect();
        assert_eq!(months, vec![1, 2, 3]);
        assert_eq!(by_key.totals.gross_pay, dec!(120006.00));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a MySQL server at DATABASE_URL"]
    async fn replace_swaps_the_certificate_and_its_rows(pool: MySqlPool) {
        let store = MySqlCertificateStore::new(pool.clone());
        let original = store
            .insert(&new_certificate(2, 2024, &[1, 2], 1))
            .await
            .unwrap()
            .unwrap();

        let replaced = store
            .replace(&new_certificate(2, 2024, &[1, 2, 3, 4], 3))
            .await
            .unwrap();

        assert_ne!(replaced.id, original.id);
        assert!(store.find_by_id(original.id).await.unwrap().is_none());
        assert_eq!(breakdown_count(&pool).await, 4);
        assert_eq!(store.find(2, 2024).await.unwrap().unwrap(), replaced);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a MySQL server at DATABASE_URL"]
    async fn year_listing_pages_and_filters(pool: MySqlPool) {
        let store = MySqlCertificateStore::new(pool);
        for employee_id in 1..=3 {
            store
                .insert(&new_certificate(employee_id, 2024, &[1], 1))
                .await
                .unwrap();
        }
        store.insert(&new_certificate(1, 2023, &[6, 7], 1)).await.unwrap();

        let year = store.for_year(2024).await.unwrap();
        assert_eq!(year.iter().map(|c| c.employee_id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(year.iter().all(|c| c.monthly_breakdown.len() == 1));

        let page = store
            .list(&CertificateFilter {
                tax_year: Some(2024),
                page: 2,
                per_page: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].employee_id, 3);

        let far = store
            .list(&CertificateFilter {
                page: u32::MAX,
                per_page: 100,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(far.total, 4);
        assert!(far.data.is_empty());
    }
}
