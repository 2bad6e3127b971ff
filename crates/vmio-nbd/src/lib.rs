//! vmio NBD - Network Block Device client
//!
//! Implements the client side of the NBD fixed-newstyle protocol over
//! TCP or Unix sockets: handshake and option negotiation, transmission
//! phase commands, structured replies, and meta contexts for allocation
//! and dirty-bitmap extents. Also provides the qemu-nbd supervisor used
//! to expose arbitrary disk image formats as NBD exports.

pub mod addr;
pub mod client;
pub mod error;
pub mod proto;
pub mod qemu_img;
pub mod qemu_nbd;

pub use addr::{Address, NbdUrl};
pub use client::{Client, WireExtent, merged};
pub use error::{Error, Result};
