#![allow(dead_code)]
//! DLMM Pilot - Multi-Tenant Liquidity Bot Engine
//!
//! A backend engine that runs many autonomous liquidity bots over
//! concentrated-liquidity (DLMM) pools inside one process. Each bot scans a
//! pool universe, opens positions when its entry criteria are met, monitors
//! them, and closes them on risk or profit triggers. Bot state survives
//! restarts through SQLite-backed persistence.
//!
//! # Modules
//!
//! - `domain`: Core business logic (positions, scoring, emergency stop, circuit breaker)
//! - `ports`: Trait abstractions (Executor, PoolApi, DlmmClient, Predictor)
//! - `adapters`: External implementations (pool API, shared cache, chain, storage)
//! - `engine`: Per-bot trading engine, market-data provider, executors
//! - `application`: Orchestrator and event bus
//! - `config`: Environment configuration loading and validation

pub mod domain;
pub mod ports;
pub mod adapters;
pub mod engine;
pub mod application;
pub mod config;
