//! API route configuration.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::state::AppState;

/// Creates the API router.
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        // Liveness (no auth)
        .route("/health", get(handlers::health))
        // Device operations
        .route("/device/exec", post(handlers::exec_device))
        .route("/device/bulk", post(handlers::bulk_device))
        .route("/device/test", post(handlers::test_device))
        // Jobs
        .route("/job", get(handlers::get_job).delete(handlers::cancel_job))
        .route("/jobs", get(handlers::list_jobs))
        // Workers
        .route(
            "/worker",
            get(handlers::get_workers).delete(handlers::terminate_worker),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatch::Dispatcher;
    use crate::driver::DriverRegistry;
    use crate::scheduler::SchedulerRegistry;
    use crate::store::RedisStore;

    // Router construction must not panic; exercised without a live Redis by
    // skipping when none is reachable.
    #[tokio::test]
    async fn router_builds_when_store_is_available() {
        let config = Arc::new(Config::default());
        let Ok(store) = RedisStore::connect(&config.redis).await else {
            eprintln!("skipping: no local Redis");
            return;
        };
        let dispatcher = Dispatcher::new(
            store,
            config.clone(),
            Arc::new(DriverRegistry::with_builtins(&config.drivers.enabled).unwrap()),
            Arc::new(SchedulerRegistry::with_builtins()),
        );
        let state = Arc::new(AppState::new(dispatcher, config));
        let _router = api_routes(state);
    }
}
