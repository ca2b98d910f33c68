use rust_decimal::Decimal;
use serde::Serialize;
use utoipa::ToSchema;

use crate::model::p9::MonthlyRow;
use crate::p9::error::{P9Error, P9Result};
use crate::p9::service::GenerationService;

/// Fixed field list handed to the P9 correction form.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct FlatAggregateRecord {
    pub employee_id: u64,
    pub employee_name: Option<String>,
    pub tax_year: i32,
    pub payslip_count: u32,
    pub total_basic_salary: Decimal,
    pub total_gross_pay: Decimal,
    pub total_housing_levy: Decimal,
    pub total_health_levy: Decimal,
    pub total_retirement_contribution: Decimal,
    pub total_deductions: Decimal,
    pub total_chargeable_pay: Decimal,
    pub total_personal_relief: Decimal,
    pub total_insurance_relief: Decimal,
    pub total_paye_tax: Decimal,
    pub monthly_rows: Vec<MonthlyRow>,
}

/// Either a record ready for the form or an explanation of why there is
/// nothing to fill in.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FormPayload {
    Ready { data: FlatAggregateRecord },
    NoData {
        employee_id: u64,
        tax_year: i32,
        message: String,
    },
}

/// Read-only rehearsal of certificate generation for operator forms.
pub struct AutoPopulateBridge<'a> {
    service: &'a GenerationService,
}

impl<'a> AutoPopulateBridge<'a> {
    pub fn new(service: &'a GenerationService) -> Self {
        Self { service }
    }

    pub async fn build_form_payload(&self, employee_id: u64, tax_year: i32) -> P9Result<FormPayload> {
        let aggregate = match self.service.preview(employee_id, tax_year).await {
            Ok(aggregate) => aggregate,
            Err(e @ P9Error::InsufficientData { .. }) => {
                return Ok(FormPayload::NoData {
                    employee_id,
                    tax_year,
                    message: e.to_string(),
                });
            }
            Err(e) => {
                e.log(employee_id);
                return Err(e);
            }
        };

        let employee_name = self
            .service
            .employee_name(employee_id)
            .await
            .inspect_err(|e| e.log(employee_id))?;
        let t = aggregate.totals;

        Ok(FormPayload::Ready {
            data: FlatAggregateRecord {
                employee_id,
                employee_name,
                tax_year,
                payslip_count: aggregate.payslip_count,
                total_basic_salary: t.basic_salary,
                total_gross_pay: t.gross_pay,
                total_housing_levy: t.housing_levy,
                total_health_levy: t.health_levy,
                total_retirement_contribution: t.retirement_contribution,
                total_deductions: t.total_deductions,
                total_chargeable_pay: t.chargeable_pay,
                total_personal_relief: t.personal_relief,
                total_insurance_relief: t.insurance_relief,
                total_paye_tax: t.paye_tax,
                monthly_rows: aggregate.monthly_rows,
            },
        })
    }
}
