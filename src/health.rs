use axum::extract::State;
use axum::http::StatusCode;

use crate::proxy::AppState;

pub const STATUS_CHECK_PATH: &str = "/openaperture_router_status_check";

/// The router reports unavailable once its route table has gone this
/// long without a successful refresh.
pub const MAX_REFRESH_AGE_SECS: u64 = 600;

/// Liveness check driven entirely by the route refresher's clock: a
/// router that has never refreshed, or whose table has gone stale, is
/// reported unavailable so the fleet can rotate it out.
pub async fn status_check(State(state): State<AppState>) -> StatusCode {
    refresh_status(state.clock.age_secs())
}

fn refresh_status(age_secs: Option<u64>) -> StatusCode {
    match age_secs {
        None => StatusCode::SERVICE_UNAVAILABLE,
        Some(age) if age > MAX_REFRESH_AGE_SECS => StatusCode::SERVICE_UNAVAILABLE,
        Some(_) => StatusCode::OK,
    }
}
