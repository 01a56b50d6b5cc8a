pub mod annotate;
pub mod cli;
pub mod config;
pub mod db;
pub mod diff;
pub mod error;
pub mod ingest;
pub mod model;
pub mod parsers;
pub mod reconcile;
pub mod report;
pub mod scm;
pub mod settings;
pub mod tasks;
