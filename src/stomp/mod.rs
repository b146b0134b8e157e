// STOMP 1.2 client used as the broker transport

pub mod frame;
pub mod websocket;

pub use frame::{Command, Frame};
pub use websocket::{StompSession, StompTransport};
