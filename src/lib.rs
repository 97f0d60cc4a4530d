#![allow(clippy::new_without_default)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;

pub mod background;
pub mod config;
pub mod dispatcher;
pub mod driving_metrics;
pub mod error;
pub mod gps_processor;
pub mod job;
pub mod live_map;
pub mod logs;
pub mod offline_queue;
pub mod raw_data;
pub mod relay;
pub mod route_engine;
pub mod sampler;
pub mod tracker;
pub mod utils;
pub mod wire;
