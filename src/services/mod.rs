//! Scoring, matching, and external service integrations

pub mod album_matcher;
pub mod collector;
pub mod filename;
pub mod metadata;
pub mod metadata_cache;
pub mod scorer;
pub mod text_match;
