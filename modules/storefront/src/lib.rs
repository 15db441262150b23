pub mod clock;
pub mod config;
pub mod db;
pub mod events;
pub mod health;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;

pub use routes::build_router;
pub use state::AppState;
