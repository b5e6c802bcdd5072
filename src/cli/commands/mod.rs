pub mod config;
pub mod health;
pub mod models;
pub mod run;
