//! Programmer for the Brutzelkarte flash cartridge.
//!
//! [`frame`] and [`device`] speak the link protocol over any [`transport`],
//! [`flasher`] runs the pipelined programming sequences on top of it.
//! [`dfs`] builds the DragonFS image holding the cartridge configuration and
//! [`memory`] keeps track of ROM partitions and save RAM, persisted through
//! [`layout`].

pub mod device;
pub mod dfs;
pub mod error;
pub mod flasher;
pub mod frame;
pub mod layout;
pub mod logger;
pub mod memory;
pub mod rom;
pub mod transport;

pub use error::{BrutzelError, Result};
