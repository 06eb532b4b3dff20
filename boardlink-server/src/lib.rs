//! Share USB-attached microcontroller boards between network clients.
//!
//! Clients connect over a websocket, list the boards currently plugged in,
//! take an exclusive lock on one of them, stream a firmware image and have
//! it programmed, or attach to the board's serial port.

pub mod board;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod connections;
pub mod context;
pub mod cooldown;
pub mod daemon;
pub mod error;
pub mod handshake;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod tool;
pub mod tracing;
pub mod transfer;
pub mod transport;
