//! Router

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{
    activate_creator, balance, create_checkout, health_check, payout_status, spend, stripe_webhook,
    support_aggregate, target_counters, verification,
};
use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health_check))
        // Credits
        .route("/spend", post(spend))
        .route("/balance", get(balance))
        // Payments
        .route("/checkout", post(create_checkout))
        .route("/webhook", post(stripe_webhook))
        // Creators
        .route("/creators", post(activate_creator))
        .route("/verification", get(verification))
        .route("/payout-status", get(payout_status))
        // Targets
        .route("/support/aggregate", get(support_aggregate))
        .route("/targets/counters", get(target_counters))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
