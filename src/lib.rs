//! Cache-first data synchronization for the nutrition-tracking client.
//!
//! Screens show cached data immediately and refresh it in the background.
//! [`orchestrator::LoadOrchestrator`] owns that policy on top of
//! [`cache::TypedCache`], [`polling::PollingSyncController`] keeps watched
//! resources current, and [`session::ViewLoadSession`] ties a resource to a
//! screen's visibility.

pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod gateway;
pub mod harness;
pub mod lifecycle;
pub mod logging;
pub mod observable;
pub mod orchestrator;
pub mod polling;
pub mod session;
