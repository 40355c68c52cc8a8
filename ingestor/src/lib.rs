pub mod config;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod rest;
pub mod schema;
pub mod validate;
