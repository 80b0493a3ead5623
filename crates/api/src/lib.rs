//! HTTP surface of the backup daemon: service wiring, routing and
//! request/response mapping.

pub mod app;
