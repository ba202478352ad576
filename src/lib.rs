pub mod app;
pub mod approval;
pub mod capability;
pub mod config;
pub mod diff;
pub mod engine;
pub mod events;
pub mod pipeline;
pub mod scan;
pub mod shared;
