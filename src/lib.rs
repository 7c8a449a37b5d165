pub mod clients;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod executor;
pub mod failure;
pub mod model;
