#![allow(clippy::result_large_err)]

pub mod action;
pub mod app;
pub mod cache;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod qc;
pub mod retry;
pub mod routing;
pub mod storage;
pub mod telemetry;

pub mod transport;
