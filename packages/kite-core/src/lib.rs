// Kite - distributed job execution core
//
// This crate provides the queue/worker backbone that sits between request
// submitters (REST/RPC facades, the admin tool) and the per-jurisdiction
// scrapers: a priority job queue with pluggable backends, a worker pool with
// bounded retries, a dead-letter queue, and queue metrics.
//
// Scraping itself lives in the kite-scrapers crate; storage and the outer
// API surface are external collaborators addressed through handler traits.

pub mod config;
pub mod error;
pub mod jobs;

pub use config::*;
pub use error::JobError;
