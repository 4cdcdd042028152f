#![doc = include_str!("../README.md")]

pub mod conn;
pub mod msg;
pub mod server;
pub mod store;
