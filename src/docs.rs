use crate::api::admin_p9::{BulkGenerate, EmployeeYear};
use crate::api::p9::{GenerateP9, GenerateResponse, P9ListQuery, SummaryResponse};
use crate::model::p9::{MonthlyRow, P9Certificate, P9CertificateSummary};
use crate::model::payslip::PayAmounts;
use crate::p9::autopopulate::{FlatAggregateRecord, FormPayload};
use crate::p9::service::{
    BulkItem, BulkItemStatus, BulkReport, GenerationOutcome, PayslipSummary, YearPayslipSummary,
};
use crate::p9::store::CertificatePage;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "P9 Certificate API",
        version = "1.0.0",
        description = r#"
## P9 Tax Deduction Cards

Annual P9 certificates built from the monthly payslips already computed by
payroll.

### Key Features
- **Certificates**
  - Generate or fetch an employee's certificate for a tax year (at most one per year)
  - List, view and download certificates as CSV tax cards
- **Administration**
  - Auto-populate the correction form from payroll data
  - Regenerate a certificate after payroll corrections
  - Bulk generation for a whole tax year
  - One ZIP with every certificate document of a year
  - Payslip coverage of every employee for a year

### Security
All endpoints require a **JWT Bearer** access token. Employees only see
their own certificates; HR and Admin act on anyone's.

### Amounts
Money is a decimal string with two places, e.g. `"153000.00"`.
"#,
    ),
    paths(
        crate::api::p9::list_certificates,
        crate::api::p9::get_certificate,
        crate::api::p9::generate_certificate,
        crate::api::p9::download_certificate,
        crate::api::p9::payslip_summary,

        crate::api::admin_p9::auto_populate,
        crate::api::admin_p9::regenerate,
        crate::api::admin_p9::bulk_generate,
        crate::api::admin_p9::download_documents
    ),
    components(
        schemas(
            PayAmounts,
            MonthlyRow,
            P9Certificate,
            P9CertificateSummary,
            CertificatePage,
            P9ListQuery,
            GenerateP9,
            GenerateResponse,
            GenerationOutcome,
            PayslipSummary,
            YearPayslipSummary,
            SummaryResponse,
            EmployeeYear,
            BulkGenerate,
            BulkReport,
            BulkItem,
            BulkItemStatus,
            FlatAggregateRecord,
            FormPayload
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "P9", description = "P9 certificate APIs"),
        (name = "P9 Admin", description = "P9 administration APIs"),
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}
