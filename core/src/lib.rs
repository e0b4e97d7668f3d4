//! recon-core: three-way payment reconciliation.
//!
//! Internal ledger, ERP and PSP settlement feeds are matched per merchant
//! reference, doubtful references become exception cases with a review
//! chain, and closed days roll up into a monthly ERP batch.

pub mod clock;
pub mod command;
pub mod config;
pub mod daily_ops;
pub mod decision;
pub mod engine;
pub mod error;
pub mod event;
pub mod exception;
pub mod feedback;
pub mod matcher;
pub mod monthly_close;
pub mod notification;
pub mod review;
pub mod rng;
pub mod run;
pub mod scenario;
pub mod snapshot;
pub mod stage;
pub mod store;
pub mod transaction;
pub mod types;
pub mod workers;
