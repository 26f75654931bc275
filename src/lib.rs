//! Forwards object-storage "object created" notifications to an analytics
//! database ingestion endpoint, one ingestion request per object.

pub mod config;
pub mod credentials;
pub mod decoder;
pub mod forwarder;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod reporter;
