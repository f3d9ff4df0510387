//! Pending-media producer: polls token records that still need their media
//! processed, pushes one queue message per token and marks the batch as sent.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod guard;
pub mod model;
pub mod producer;
pub mod queue;
pub mod scheduler;
