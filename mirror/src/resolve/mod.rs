//! Resolution of the image set to mirror.
//!
//! Starting from release-channel heads or a pinned build tag, these
//! helpers compute which versions, digest closures, auxiliary images and
//! attestations the transfer engine must move. All functions here are
//! pure; the surrounding orchestration does the network and disk I/O.

pub mod closure;
pub mod platform;
pub mod vex;
