pub mod mysql;
pub mod service;
