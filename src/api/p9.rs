use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{HttpResponse, Responder, web};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::auth::AuthUser;
use crate::model::p9::P9Certificate;
use crate::p9::error::{P9Error, P9Result};
use crate::p9::service::{GenerationOutcome, GenerationService, PayslipSummary, YearPayslipSummary};
use crate::p9::store::CertificateFilter;

#[derive(Deserialize, IntoParams, ToSchema)]
pub struct P9ListQuery {
    #[schema(example = 1)]
    pub page: Option<u32>,

    #[schema(example = 10)]
    pub per_page: Option<u32>,

    /// Ignored for employees, who only see their own certificates
    #[schema(example = 1001)]
    pub employee_id: Option<u64>,

    #[schema(example = 2024)]
    pub tax_year: Option<i32>,
}

#[derive(Deserialize, ToSchema)]
pub struct GenerateP9 {
    #[schema(example = 2024)]
    pub tax_year: i32,

    /// Honoured for HR/Admin only
    #[schema(example = 1001)]
    pub employee_id: Option<u64>,
}

#[derive(Serialize, ToSchema)]
pub struct GenerateResponse {
    pub outcome: GenerationOutcome,
    pub message: String,
    pub certificate: P9Certificate,
}

#[derive(Deserialize, IntoParams)]
pub struct SummaryQuery {
    /// Defaults to the current year
    pub year: Option<i32>,
    /// HR/Admin only; without it staff get the whole year
    pub employee_id: Option<u64>,
}

/// One employee's payslips, or the whole year's for staff.
#[derive(Serialize, ToSchema)]
#[serde(untagged)]
pub enum SummaryResponse {
    Employee(PayslipSummary),
    Year(YearPayslipSummary),
}

/// Loads a certificate the caller is allowed to see. Someone else's
/// certificate looks exactly like a missing one.
async fn visible_certificate(
    auth: &AuthUser,
    service: &GenerationService,
    id: u64,
) -> P9Result<P9Certificate> {
    let certificate = service.get(id).await?;
    if !auth.can_view(certificate.employee_id) {
        return Err(P9Error::NotFound);
    }
    Ok(certificate)
}

#[utoipa::path(
    get,
    path = "/api/reports/p9",
    params(P9ListQuery),
    responses(
        (status = 200, body = crate::p9::store::CertificatePage),
        (status = 401),
        (status = 403)
    ),
    security(("bearer_auth" = [])),
    tag = "P9"
)]
pub async fn list_certificates(
    auth: AuthUser,
    service: web::Data<GenerationService>,
    query: web::Query<P9ListQuery>,
) -> actix_web::Result<impl Responder> {
    let employee_id = if auth.is_staff() {
        query.employee_id
    } else {
        Some(auth.resolve_employee(None)?)
    };

    let filter = CertificateFilter {
        employee_id,
        tax_year: query.tax_year,
        page: query.page.unwrap_or(1),
        per_page: query.per_page.unwrap_or(10),
    };

    let page = service.list(&filter).await.inspect_err(|e| {
        tracing::error!(error = %e, "Failed to list P9 certificates");
    })?;

    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    get,
    path = "/api/reports/p9/{id}",
    params(
        ("id", description = "Certificate ID")
    ),
    responses(
        (status = 200, body = P9Certificate),
        (status = 404, description = "Certificate not found")
    ),
    security(("bearer_auth" = [])),
    tag = "P9"
)]
pub async fn get_certificate(
    auth: AuthUser,
    service: web::Data<GenerationService>,
    path: web::Path<u64>,
) -> actix_web::Result<impl Responder> {
    let certificate = visible_certificate(&auth, &service, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(certificate))
}

#[utoipa::path(
    post,
    path = "/api/reports/p9",
    request_body = GenerateP9,
    responses(
        (status = 201, description = "Certificate generated", body = GenerateResponse),
        (status = 200, description = "Certificate already on file", body = GenerateResponse),
        (status = 400, description = "Tax year out of range"),
        (status = 409, description = "Payroll data failed validation"),
        (status = 422, description = "No payslips for the tax year"),
        (status = 503, description = "Store temporarily unavailable")
    ),
    security(("bearer_auth" = [])),
    tag = "P9"
)]
pub async fn generate_certificate(
    auth: AuthUser,
    service: web::Data<GenerationService>,
    payload: web::Json<GenerateP9>,
) -> actix_web::Result<impl Responder> {
    let employee_id = auth.resolve_employee(payload.employee_id)?;

    let generation = service
        .generate_or_fetch(employee_id, payload.tax_year, Some(auth.user_id))
        .await?;

    let (mut response, message) = match generation.outcome {
        GenerationOutcome::Generated => (
            HttpResponse::Created(),
            format!("P9 certificate for {} generated", payload.tax_year),
        ),
        GenerationOutcome::AlreadyOnFile => (
            HttpResponse::Ok(),
            format!("P9 certificate for {} already on file", payload.tax_year),
        ),
    };

    Ok(response.json(GenerateResponse {
        outcome: generation.outcome,
        message,
        certificate: generation.certificate,
    }))
}

#[utoipa::path(
    get,
    path = "/api/reports/p9/{id}/document",
    params(
        ("id", description = "Certificate ID")
    ),
    responses(
        (status = 200, description = "Tax deduction card", body = String, content_type = "text/csv"),
        (status = 404, description = "Certificate not found"),
        (status = 500, description = "Document could not be rendered")
    ),
    security(("bearer_auth" = [])),
    tag = "P9"
)]
pub async fn download_certificate(
    auth: AuthUser,
    service: web::Data<GenerationService>,
    path: web::Path<u64>,
) -> actix_web::Result<impl Responder> {
    let certificate = visible_certificate(&auth, &service, path.into_inner()).await?;
    let document = service.render_certificate(&certificate)?;

    Ok(HttpResponse::Ok()
        .content_type(document.content_type)
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(document.file_name)],
        })
        .body(document.bytes))
}

#[utoipa::path(
    get,
    path = "/api/reports/p9/payslip-summary",
    params(SummaryQuery),
    responses(
        (status = 200, body = SummaryResponse),
        (status = 400, description = "Tax year out of range"),
        (status = 403, description = "No employee record linked to this user")
    ),
    security(("bearer_auth" = [])),
    tag = "P9"
)]
pub async fn payslip_summary(
    auth: AuthUser,
    service: web::Data<GenerationService>,
    query: web::Query<SummaryQuery>,
) -> actix_web::Result<impl Responder> {
    let year = query.year.unwrap_or_else(|| service.current_year());

    let summary = if auth.is_staff() && query.employee_id.is_none() {
        SummaryResponse::Year(service.year_summary(year).await?)
    } else {
        let employee_id = auth.resolve_employee(query.employee_id)?;
        SummaryResponse::Employee(service.payslip_summary(employee_id, year).await?)
    };

    Ok(HttpResponse::Ok().json(summary))
}
