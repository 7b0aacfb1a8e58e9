pub mod api;
pub mod config;
pub mod db;
pub mod jobs;
pub mod observability;
pub mod scrape;
pub mod webhook;
