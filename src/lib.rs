pub mod app_state;
pub mod handlers;
pub mod routes;
pub mod utils;

pub use app_state::AppState;
