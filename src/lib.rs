pub mod classifier;
pub mod config;
pub mod controller;
pub mod feed;
pub mod navigator;
pub mod provider;
pub mod sink;
pub mod telegram;
pub mod types;

/// Telegram Bot API base URL (alert channel).
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
