//! Core runtime of a multi-exchange trading bot: a supervised tree of
//! message-passing components that ingest live market data, run scripted
//! strategies, gate every trade intent through risk validation and manage
//! advanced order types against real exchange endpoints.

pub mod application;
pub mod config;
pub mod domain;
pub mod indicators;
pub mod infrastructure;
pub mod runtime;
