pub mod api_handlers;
pub mod health_handlers;
