//! Wire-format types shared between the Atmosphere node, its compute
//! runtime, and (eventually) lighter-weight peers that only need to
//! speak the gossip/capability vocabulary without pulling in libp2p,
//! fjall, or wasmtime.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod announcement;
pub mod capability;
pub mod cost;
pub mod token;

pub use announcement::{Announcement, AnnouncementKind};
pub use capability::{Capability, CapabilityStatus, CapabilityType, Tool, Trigger};
pub use cost::{CostFactors, PowerMode};
pub use token::{JoinEndpoints, Token};
