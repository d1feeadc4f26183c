pub mod auth;
pub mod logging;

pub use auth::ApiKeyAuth;
pub use logging::RequestLogging;
