#![forbid(unsafe_code)]

pub mod audit;
pub mod auth;
pub mod connection;
pub mod control;
pub mod http;
pub mod outbound;
pub mod pipeline;
pub mod registry;
pub mod relay;
pub mod replay;
pub mod session;
pub mod state;
pub mod watchdog;

#[cfg(test)]
mod fakes;


#[cfg(test)]
mod pipeline_tests;

#[cfg(test)]
mod registry_tests;
