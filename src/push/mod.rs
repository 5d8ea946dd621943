//! Push Fabric — authenticated bidirectional channel delivering
//! `kline-update`/`alert-triggered`/`kline-error` events to the right user.

pub mod events;
pub mod hub;
pub mod socket;

pub use hub::{ClientId, Hub};
