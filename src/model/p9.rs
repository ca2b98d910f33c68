use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use utoipa::ToSchema;

use crate::model::payslip::PayAmounts;

/// Tax years a certificate may be issued for.
pub const TAX_YEARS: RangeInclusive<i32> = 2020..=2050;

/// One month of a certificate's breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct MonthlyRow {
    #[schema(example = 1)]
    pub month: u8,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub amounts: PayAmounts,
}

/// Annual figures for one employee and tax year, before they are stored.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Aggregate {
    pub employee_id: u64,
    pub tax_year: i32,
    pub payslip_count: u32,
    pub totals: PayAmounts,
    /// Ascending by month
    pub monthly_rows: Vec<MonthlyRow>,
}

/// A stored P9 tax deduction card.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[schema(example = json!({
    "id": 7,
    "employee_id": 1001,
    "tax_year": 2024,
    "payslip_count": 3,
    "totals": {
        "basic_salary": "150000.00",
        "gross_pay": "153000.00",
        "housing_levy": "2295.00",
        "health_levy": "4207.50",
        "retirement_contribution": "6480.00",
        "total_deductions": "12982.50",
        "chargeable_pay": "140017.50",
        "personal_relief": "7200.00",
        "insurance_relief": "0.00",
        "paye_tax": "27530.00"
    },
    "generated_by": 1,
    "generated_at": "2025-01-15T08:30:00Z",
    "monthly_breakdown": []
}))]
pub struct P9Certificate {
    pub id: u64,
    pub employee_id: u64,
    pub tax_year: i32,
    pub payslip_count: u32,
    pub totals: PayAmounts,
    /// User who triggered generation, if known
    pub generated_by: Option<u64>,
    #[schema(value_type = String, format = "date-time")]
    pub generated_at: DateTime<Utc>,
    pub monthly_breakdown: Vec<MonthlyRow>,
}

/// Certificate header without its monthly rows, used by list endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow, ToSchema)]
pub struct P9CertificateSummary {
    pub id: u64,
    pub employee_id: u64,
    pub tax_year: i32,
    pub payslip_count: u32,
    #[sqlx(flatten)]
    pub totals: PayAmounts,
    pub generated_by: Option<u64>,
    #[schema(value_type = String, format = "date-time")]
    pub generated_at: DateTime<Utc>,
}

impl P9CertificateSummary {
    pub fn with_rows(self, monthly_breakdown: Vec<MonthlyRow>) -> P9Certificate {
        P9Certificate {
            id: self.id,
            employee_id: self.employee_id,
            tax_year: self.tax_year,
            payslip_count: self.payslip_count,
            totals: self.totals,
            generated_by: self.generated_by,
            generated_at: self.generated_at,
            monthly_breakdown,
        }
    }
}

/// Everything needed to persist a new certificate.
#[derive(Debug, Clone)]
pub struct NewCertificate {
    pub aggregate: Aggregate,
    pub generated_by: Option<u64>,
    pub generated_at: DateTime<Utc>,
}

impl NewCertificate {
    pub fn into_certificate(self, id: u64) -> P9Certificate {
        P9Certificate {
            id,
            employee_id: self.aggregate.employee_id,
            tax_year: self.aggregate.tax_year,
            payslip_count: self.aggregate.payslip_count,
            totals: self.aggregate.totals,
            generated_by: self.generated_by,
            generated_at: self.generated_at,
            monthly_breakdown: self.aggregate.monthly_rows,
        }
    }
}
