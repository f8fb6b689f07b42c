use axum::{routing::get, Router};

use crate::state::AppState;

pub mod billing;
pub mod health;
pub mod ledger;
pub mod payments;
pub mod utility_bills;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(billing::router())
        .merge(utility_bills::router())
        .merge(payments::router())
        .merge(ledger::router())
}
