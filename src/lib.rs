// Configuration loading
pub mod config;

// Shared SQLite helpers
pub mod db;

// Encrypted integration storage
pub mod credentials;

// OAuth flows, token exchange and refresh
pub mod oauth;

// User identification for API requests
pub mod auth;

// HTTP APIs
pub mod api;
