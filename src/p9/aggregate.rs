//! Reduction of a year of payslips into P9 totals and monthly rows.
//!
//! Everything here is pure: no store access, no clock. The same function
//! backs certificate generation and the auto-populate preview.

use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::BTreeMap;
use std::fmt;

use crate::model::p9::{Aggregate, MonthlyRow};
use crate::model::payslip::{PayAmounts, Payslip};
use crate::p9::error::{P9Error, P9Result};

/// Allowed difference per field between a certificate total and the sum of
/// its monthly rows (0.01).
pub const MONEY_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Rounds half-up to two decimal places and pins the scale at 2.
pub fn round_money(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded
}

/// Aggregates one employee's payslips for one tax year.
///
/// Totals are summed exactly and rounded once at the end. Rows come back in
/// ascending month order whatever the input order.
pub fn aggregate(payslips: &[Payslip], employee_id: u64, tax_year: i32) -> P9Result<Aggregate> {
    if payslips.is_empty() {
        return Err(P9Error::InsufficientData {
            employee_id,
            tax_year,
        });
    }

    let mut by_month: BTreeMap<u8, &Payslip> = BTreeMap::new();
    let mut sum = PayAmounts::default();

    for payslip in payslips {
        if payslip.employee_id != employee_id || payslip.tax_year != tax_year {
            return Err(P9Error::DataIntegrity {
                tax_year,
                reason: format!(
                    "payslip {} belongs to employee {} / tax year {}, expected employee {} / tax year {}",
                    payslip.id, payslip.employee_id, payslip.tax_year, employee_id, tax_year
                ),
            });
        }

        if !(1..=12).contains(&payslip.month) {
            return Err(P9Error::DataIntegrity {
                tax_year,
                reason: format!("payslip {} has invalid month {}", payslip.id, payslip.month),
            });
        }

        if by_month.insert(payslip.month, payslip).is_some() {
            return Err(P9Error::DuplicateMonth {
                employee_id,
                tax_year,
                month: payslip.month,
            });
        }

        sum += payslip.amounts;
    }

    let monthly_rows = by_month
        .into_values()
        .map(|p| MonthlyRow {
            month: p.month,
            amounts: p.amounts,
        })
        .collect();

    Ok(Aggregate {
        employee_id,
        tax_year,
        payslip_count: payslips.len() as u32,
        totals: sum.map(round_money),
        monthly_rows,
    })
}

/// A field whose certificate total disagrees with its monthly rows.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMismatch {
    pub field: &'static str,
    pub total: Decimal,
    pub rows_sum: Decimal,
}

impl fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total {} vs monthly rows {}",
            self.field, self.total, self.rows_sum
        )
    }
}

/// Compares every total with the sum of the same field over `rows`.
pub fn reconcile(totals: &PayAmounts, rows: &[MonthlyRow]) -> Vec<FieldMismatch> {
    let mut rows_sum = PayAmounts::default();
    for row in rows {
        rows_sum += row.amounts;
    }

    totals
        .fields()
        .into_iter()
        .zip(rows_sum.fields())
        .filter(|((_, total), (_, sum))| (*total - *sum).abs() > MONEY_TOLERANCE)
        .map(|((field, total), (_, sum))| FieldMismatch {
            field,
            total,
            rows_sum: sum,
        })
        .collect()
}

/// Refuses an aggregate whose rows do not add up to its totals.
pub fn ensure_reconciled(aggregate: &Aggregate) -> P9Result<()> {
    let mismatches = reconcile(&aggregate.totals, &aggregate.monthly_rows);
    if mismatches.is_empty() {
        return Ok(());
    }

    Err(P9Error::DataIntegrity {
        tax_year: aggregate.tax_year,
        reason: mismatches
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; "),
    })
}
