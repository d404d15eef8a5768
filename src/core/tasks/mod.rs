// src/core/tasks/mod.rs

//! Long-running background tasks that support request serving.

pub mod cache_reaper;
