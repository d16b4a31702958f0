//! clouddrop-hub: the CloudDrop signaling hub.
//!
//! A warp HTTP server exposing the `/ws` signaling socket and the small
//! room-management API. The hub owns room membership and the password gate;
//! it forwards addressed frames between peers without inspecting them and
//! relays `relay-data` traffic for peers whose direct path failed.

pub mod cli;
pub mod room;
pub mod server;
pub mod session;

pub use room::RoomRegistry;
pub use server::Hub;
