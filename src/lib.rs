//! News Vibe - a categorized news aggregator
//!
//! This crate fetches articles from RSS feeds and Reddit listings, sorts each
//! new headline into a topic category (source hint first, then a Gemini call),
//! stores the results in SQLite and serves them as a web page and JSON API.

pub mod classifier;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod routes;
