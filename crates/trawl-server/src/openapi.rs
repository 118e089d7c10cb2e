use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Trawl API",
        version = "0.1.0",
        description = "Concurrent social and web scraping jobs with live progress streams."
    ),
    paths(
        crate::routes::create_job,
        crate::routes::list_jobs,
        crate::routes::get_job,
        crate::routes::cancel_job,
        crate::routes::invalidate_cache,
        crate::routes::status,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::CreateJobRequest,
        crate::dto::CreateJobResponse,
        crate::dto::JobResponse,
        crate::dto::JobListResponse,
        crate::dto::ItemPreview,
        crate::dto::CancelJobResponse,
        crate::dto::InvalidateCacheResponse,
        crate::dto::PlatformStatsResponse,
        crate::dto::StatusResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "jobs", description = "Start, inspect and cancel scrape jobs"),
        (name = "cache", description = "Result cache maintenance"),
        (name = "system", description = "Health and live status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "API key. Set via TRAWL_SERVER_API_KEY environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
