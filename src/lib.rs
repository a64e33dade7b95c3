//! # ezreporting
//!
//! Scheduled dashboard reports for ezMESURE: a REST API to manage reporting
//! tasks, a scheduler rendering due dashboards to PDF and mailing them, and a
//! weekly activity digest for the administrators.
pub mod activity;
pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod domain;
pub mod elastic;
pub mod errors;
pub mod mail;
pub mod notifications;
pub mod render;
pub mod scheduler;
pub mod service;
