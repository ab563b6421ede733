pub mod api;
pub mod network;
