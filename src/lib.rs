//! Polling engine for the X10A serial port of Daikin Altherma heat pumps, along with the tools
//! built on top of it.

pub mod climate;
pub mod commands;
pub mod connection;
pub mod convert;
pub mod engine;
pub mod homie;
pub mod output;
pub mod protocol;
pub mod registers;
pub mod sensor;
pub mod transport;
