//! autorip: an automatic disc ripping server.
//!
//! Insert a disc, hit start (or let the frontend do it), and the engine
//! scans it with MakeMKV, rips the main feature or the episode set,
//! identifies the title, files it into the movie or TV library, and asks
//! the media server to rescan. Unconfident identifications land in a
//! review folder instead; interrupted rips are recovered on startup.

pub mod activity;
pub mod api;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod identify;
pub mod job;
pub mod logging;
pub mod makemkv;
pub mod notify;

pub use error::{Error, Result};
