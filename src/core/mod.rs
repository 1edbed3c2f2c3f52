//! Core library modules for drivetime-matrix
//!
//! This module contains the synchronisation engine and its collaborators.

pub mod config;
pub mod diff;
pub mod entity;
pub mod error;
pub mod geocode;
pub mod matrix;
pub mod report;
pub mod retry;
pub mod route;
pub mod store;
pub mod sync;
