//! VOD transcoding coordinator.
//!
//! Accepts upload jobs describing a source video and desired output
//! renditions, copies the source into working storage, probes it, drives
//! transcoding through one of the configurable pipelines (in-process
//! segmenter + broadcaster network, or an external provider), assembles HLS
//! playlists and optional MP4 / fragmented-MP4 renditions, and reports
//! lifecycle progress through callbacks.
//!
//! The coordinator is an embedded component: transport, object-store
//! drivers, FFmpeg invocation, and the broadcaster wire protocol are
//! consumed through the narrow seams in [`storage`], [`media`],
//! [`broadcaster`], and [`callback`].

pub mod broadcaster;
pub mod callback;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod logging;
pub mod media;
pub mod metrics;
pub mod panic_hook;
pub mod pipeline;
pub mod retry;
pub mod storage;

pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorDeps, Strategy, VodCoordinator};
pub use error::{JobError, Result};
