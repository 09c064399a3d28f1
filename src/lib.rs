pub mod api;
pub mod auth;
pub mod certificate;
pub mod chapter;
pub mod config;
pub mod coupon;
pub mod db;
pub mod error;
pub mod gating;
pub mod payment;
pub mod progress;
pub mod quiz;
pub mod server;
pub mod utils;
