pub mod config;
pub mod feedback;
pub mod health;
pub mod telegram_log;
