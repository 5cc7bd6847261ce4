pub mod health;
pub mod telescope_api;
