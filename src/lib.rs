pub mod bus;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;
pub mod store;
