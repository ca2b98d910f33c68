use crate::{
    api::{admin_p9, p9},
    auth::middleware::auth_middleware,
};
use actix_governor::{
    Governor, GovernorConfig, GovernorConfigBuilder, PeerIpKeyExtractor,
    governor::middleware::NoOpMiddleware,
};
use actix_web::{middleware::from_fn, web};

pub type LimiterConfig = GovernorConfig<PeerIpKeyExtractor, NoOpMiddleware>;

/// Per-IP limiter allowing `requests_per_min` with a burst of the same size.
pub fn build_limiter(requests_per_min: u32) -> anyhow::Result<LimiterConfig> {
    let per_ms = if requests_per_min == 0 {
        1
    } else {
        (60_000 / requests_per_min as u64).max(1)
    };

    GovernorConfigBuilder::default()
        .per_millisecond(per_ms)
        .burst_size(requests_per_min.max(1))
        .key_extractor(PeerIpKeyExtractor)
        .finish()
        .ok_or_else(|| anyhow::anyhow!("invalid rate limit: {requests_per_min} per minute"))
}

pub fn configure(cfg: &mut web::ServiceConfig, api_prefix: &str, limiter: &LimiterConfig) {
    // Protected routes
    cfg.service(
        web::scope(api_prefix)
            .wrap(from_fn(auth_middleware)) // authentication
            .wrap(Governor::new(limiter)) // rate limiting
            .configure(p9_routes),
    );
}

/// P9 routes relative to the API prefix. The caller wraps them in auth.
pub fn p9_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/reports/p9")
            // /reports/p9
            .service(
                web::resource("")
                    .route(web::get().to(p9::list_certificates))
                    .route(web::post().to(p9::generate_certificate)),
            )
            // before /{id} so it is not parsed as an id
            .service(
                web::resource("/payslip-summary").route(web::get().to(p9::payslip_summary)),
            )
            // /reports/p9/{id}
            .service(web::resource("/{id}").route(web::get().to(p9::get_certificate)))
            // /reports/p9/{id}/document
            .service(
                web::resource("/{id}/document").route(web::get().to(p9::download_certificate)),
            ),
    )
    .service(
        web::scope("/admin/p9")
            .service(
                web::resource("/auto-populate").route(web::post().to(admin_p9::auto_populate)),
            )
            .service(web::resource("/regenerate").route(web::post().to(admin_p9::regenerate)))
            .service(
                web::resource("/bulk-generate").route(web::post().to(admin_p9::bulk_generate)),
            )
            .service(
                web::resource("/documents").route(web::get().to(admin_p9::download_documents)),
            ),
    );
}
