/* src/lib.rs */

pub mod auth;
pub mod balancer;
pub mod breaker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod path_matcher;
pub mod pipeline;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod routing;
pub mod server;
pub mod setup;
pub mod state;
