pub mod accumulator;
pub mod config;
pub mod credentials;
pub mod error;
pub mod explainer;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod prompt;
pub mod provider;
pub mod provider_factory;
pub mod providers;
pub mod render;
pub mod stream;
pub mod telemetry;
