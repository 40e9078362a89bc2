pub mod api_types;
pub mod catalog;
pub mod client;
pub mod types;
