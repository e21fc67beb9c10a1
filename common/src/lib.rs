//! Shared types for the Polyrec capture device and controller.
//!
//! Everything that crosses the wire lives here: the command/response
//! protocol, the discovery probe/response shapes, the clock-sync math and
//! the `polyrec.conf` configuration both binaries load.

pub mod config;
pub mod discovery;
pub mod protocol;
pub mod sync;
