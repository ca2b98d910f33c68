use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{HttpResponse, Responder, web};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use crate::auth::auth::AuthUser;
use crate::p9::autopopulate::AutoPopulateBridge;
use crate::p9::service::GenerationService;

#[derive(Deserialize, ToSchema)]
pub struct EmployeeYear {
    #[schema(example = 1001)]
    pub employee_id: u64,

    #[schema(example = 2024)]
    pub tax_year: i32,
}

#[derive(Deserialize, ToSchema)]
pub struct BulkGenerate {
    /// Defaults to the current year
    #[schema(example = 2024)]
    pub tax_year: Option<i32>,

    /// Every employee with payslips in the year when omitted
    #[schema(example = json!([1001, 1002]))]
    pub employee_ids: Option<Vec<u64>>,
}

#[derive(Deserialize, IntoParams)]
pub struct DocumentsQuery {
    /// Defaults to the current year
    pub tax_year: Option<i32>,
}

#[utoipa::path(
    post,
    path = "/api/admin/p9/auto-populate",
    request_body = EmployeeYear,
    responses(
        (status = 200, description = "`status` is `ready` with the record under `data`, or `no_data` with a message", body = crate::p9::autopopulate::FormPayload),
        (status = 403),
        (status = 409, description = "Payroll data failed validation")
    ),
    security(("bearer_auth" = [])),
    tag = "P9 Admin"
)]
pub async fn auto_populate(
    auth: AuthUser,
    service: web::Data<GenerationService>,
    payload: web::Json<EmployeeYear>,
) -> actix_web::Result<impl Responder> {
    auth.require_hr_or_admin()?;

    let form = AutoPopulateBridge::new(service.get_ref())
        .build_form_payload(payload.employee_id, payload.tax_year)
        .await?;

    Ok(HttpResponse::Ok().json(form))
}

#[utoipa::path(
    post,
    path = "/api/admin/p9/regenerate",
    request_body = EmployeeYear,
    responses(
        (status = 200, description = "Certificate replaced", body = crate::model::p9::P9Certificate),
        (status = 403, description = "Admin only"),
        (status = 422, description = "No payslips for the tax year")
    ),
    security(("bearer_auth" = [])),
    tag = "P9 Admin"
)]
pub async fn regenerate(
    auth: AuthUser,
    service: web::Data<GenerationService>,
    payload: web::Json<EmployeeYear>,
) -> actix_web::Result<impl Responder> {
    auth.require_admin()?;

    let certificate = service
        .regenerate(payload.employee_id, payload.tax_year, Some(auth.user_id))
        .await?;

    Ok(HttpResponse::Ok().json(certificate))
}

#[utoipa::path(
    post,
    path = "/api/admin/p9/bulk-generate",
    request_body = BulkGenerate,
    responses(
        (status = 200, body = crate::p9::service::BulkReport),
        (status = 403)
    ),
    security(("bearer_auth" = [])),
    tag = "P9 Admin"
)]
pub async fn bulk_generate(
    auth: AuthUser,
    service: web::Data<GenerationService>,
    payload: web::Json<BulkGenerate>,
) -> actix_web::Result<impl Responder> {
    auth.require_hr_or_admin()?;

    let BulkGenerate {
        tax_year,
        employee_ids,
    } = payload.into_inner();
    let tax_year = tax_year.unwrap_or_else(|| service.current_year());

    let report = service
        .bulk_generate(tax_year, employee_ids, Some(auth.user_id))
        .await?;

    Ok(HttpResponse::Ok().json(report))
}

#[utoipa::path(
    get,
    path = "/api/admin/p9/documents",
    params(DocumentsQuery),
    responses(
        (status = 200, description = "ZIP of every stored certificate's document; failures are listed in ERRORS.txt", body = String, content_type = "application/zip"),
        (status = 403),
        (status = 404, description = "No certificates on file for the year")
    ),
    security(("bearer_auth" = [])),
    tag = "P9 Admin"
)]
pub async fn download_documents(
    auth: AuthUser,
    service: web::Data<GenerationService>,
    query: web::Query<DocumentsQuery>,
) -> actix_web::Result<impl Responder> {
    auth.require_hr_or_admin()?;
    let tax_year = query.tax_year.unwrap_or_else(|| service.current_year());

    let document = service.documents_archive(tax_year).await?.document;

    Ok(HttpResponse::Ok()
        .content_type(document.content_type)
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(document.file_name)],
        })
        .body(document.bytes))
}

#[cfg(test)]
mod tests {
    use crate::api::p9::tests::{admin_token, bearer, employee_token, hr_token, test_app};
    use crate::model::p9::NewCertificate;
    use crate::p9::aggregate::aggregate;
    use crate::p9::aggregate::tests::payslip;
    use crate::p9::service::tests::{Fixture, fixture};
    use actix_web::http::StatusCode;
    use actix_web::test;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use serde_json::{Value, json};
    use std::io::{Cursor, Read};

    #[actix_web::test]
    async fn auto_populate_returns_ready_or_no_data_with_200() {
        let app = test_app!(fixture().service);

        let req = test::TestRequest::post()
            .uri("/api/admin/p9/auto-populate")
            .insert_header(bearer(&hr_token()))
            .set_json(json!({"employee_id": 1, "tax_year": 2024}))
            .to_request();
        let ready: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(ready["status"], "ready");
        assert_eq!(ready["data"]["total_gross_pay"], "153000.00");

        let req = test::TestRequest::post()
            .uri("/api/admin/p9/auto-populate")
            .insert_header(bearer(&hr_token()))
            .set_json(json!({"employee_id": 1, "tax_year": 2025}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let empty: Value = test::read_body_json(resp).await;
        assert_eq!(empty["status"], "no_data");
    }

    #[actix_web::test]
    async fn auto_populate_faults_are_not_2xx() {
        let Fixture { source, service, .. } = fixture();
        source.push(payslip(1, 2024, 1, dec!(1)));
        let app = test_app!(service);

        let req = test::TestRequest::post()
            .uri("/api/admin/p9/auto-populate")
            .insert_header(bearer(&admin_token()))
            .set_json(json!({"employee_id": 1, "tax_year": 2024}))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "duplicate_month");
    }

    #[actix_web::test]
    async fn employees_cannot_use_admin_routes() {
        let app = test_app!(fixture().service);

        let req = test::TestRequest::get()
            .uri("/api/admin/p9/documents?tax_year=2024")
            .insert_header(bearer(&employee_token(1)))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        for (uri, body) in [
            ("/api/admin/p9/auto-populate", json!({"employee_id": 1, "tax_year": 2024})),
            ("/api/admin/p9/regenerate", json!({"employee_id": 1, "tax_year": 2024})),
            ("/api/admin/p9/bulk-generate", json!({"tax_year": 2024})),
        ] {
            let req = test::TestRequest::post()
                .uri(uri)
                .insert_header(bearer(&employee_token(1)))
                .set_json(body)
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::FORBIDDEN, "{uri}");
        }
    }

    #[actix_web::test]
    async fn regenerate_is_admin_only_and_replaces_totals() {
        let Fixture { source, store, service } = fixture();
        service.generate_or_fetch(1, 2024, None).await.unwrap();
        source.push(payslip(1, 2024, 4, dec!(49000)));
        let app = test_app!(service);

        let req = test::TestRequest::post()
            .uri("/api/admin/p9/regenerate")
            .insert_header(bearer(&hr_token()))
            .set_json(json!({"employee_id": 1, "tax_year": 2024}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::post()
            .uri("/api/admin/p9/regenerate")
            .insert_header(bearer(&admin_token()))
            .set_json(json!({"employee_id": 1, "tax_year": 2024}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["totals"]["gross_pay"], "202000.00");
        assert_eq!(body["generated_by"], 1);
        assert_eq!(store.count(), 1);
    }

    #[actix_web::test]
    async fn bulk_generate_reports_every_employee() {
        let Fixture { source, store, service } = fixture();
        source.push(payslip(2, 2024, 1, dec!(30000)));
        let app = test_app!(service);

        let req = test::TestRequest::post()
            .uri("/api/admin/p9/bulk-generate")
            .insert_header(bearer(&hr_token()))
            .set_json(json!({"tax_year": 2024, "employee_ids": [1, 2, 3]}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["total_employees"], 3);
        assert_eq!(body["generated"], 2);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["results"][2]["status"], "failed");
        assert_eq!(body["results"][2]["error"], "insufficient_data");
        assert_eq!(store.count(), 2);
    }

    #[actix_web::test]
    async fn bulk_generate_defaults_to_the_current_year() {
        let Fixture { source, store, service } = fixture();
        source.push(payslip(4, 2025, 1, dec!(30000)));
        let app = test_app!(service);

        let req = test::TestRequest::post()
            .uri("/api/admin/p9/bulk-generate")
            .insert_header(bearer(&admin_token()))
            .set_json(json!({}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["tax_year"], 2025);
        assert_eq!(body["total_employees"], 1);
        assert_eq!(body["results"][0]["employee_id"], 4);
        assert_eq!(store.count(), 1);
    }

    #[actix_web::test]
    async fn documents_come_back_as_one_zip_with_failures_listed() {
        let Fixture { source, store, service } = fixture();
        source.push(payslip(2, 2024, 1, dec!(30000)));
        service.generate_or_fetch(1, 2024, None).await.unwrap();
        service.generate_or_fetch(2, 2024, None).await.unwrap();
        let mut unrenderable = aggregate(&[payslip(3, 2024, 1, dec!(30000))], 3, 2024).unwrap();
        unrenderable.monthly_rows[0].month = 13;
        store.put(NewCertificate {
            aggregate: unrenderable,
            generated_by: None,
            generated_at: Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap(),
        });
        let app = test_app!(service);

        let req = test::TestRequest::get()
            .uri("/api/admin/p9/documents?tax_year=2024")
            .insert_header(bearer(&hr_token()))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-type").unwrap(), "application/zip");
        let disposition = resp
            .headers()
            .get("content-disposition")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("P9_Reports_2024_All.zip"));

        let body = test::read_body(resp).await;
        let mut archive = zip::ZipArchive::new(Cursor::new(body.to_vec())).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["ERRORS.txt", "P9_2024_1.csv", "P9_2024_2.csv"]);

        let mut errors = String::new();
        archive
            .by_name("ERRORS.txt")
            .unwrap()
            .read_to_string(&mut errors)
            .unwrap();
        assert!(errors.contains("employee 3"));

        let req = test::TestRequest::get()
            .uri("/api/admin/p9/documents?tax_year=2023")
            .insert_header(bearer(&hr_token()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
