// HTTP APIs

pub mod integrations;

pub use integrations::{create_integrations_router, redirect_uri, IntegrationsAppState};
