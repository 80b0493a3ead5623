//! Infrastructure of the course backup step: job queue, runner, archive
//! engines, blob storage, catalog, remote upload and PostgreSQL adapters.

pub mod archive;
pub mod blob;
pub mod catalog;
pub mod config;
pub mod directory;
pub mod jobs;
pub mod postgres;
pub mod process;
pub mod upload;

#[cfg(test)]
mod testing;

mod integration_tests;
