pub mod backends;
pub mod controller;
pub mod files;
pub mod reload;
pub mod templates;
