//! hydra - multi-headed Soulseek download-acquisition engine
//!
//! Pulls queued searches from a post-processing bridge, runs them through a
//! Soulseek client daemon, scores the results, downloads the best match with
//! staggered fallback heads, and hands finished files back to the bridge for
//! tagging.

pub mod config;
pub mod engine;
pub mod jobs;
pub mod services;
pub mod session;
pub mod soulseek;
