//! # SBC SIP Sidecar
//!
//! Registration and health-monitoring sidecar for a session border
//! controller.
//!
//! This crate provides:
//! - Outbound trunk registration (regbots) under cluster leader election
//! - OPTIONS health checks of SIP gateways with a shared blacklist
//! - Presence tracking of internal feature and RTP servers
//! - Inbound REGISTER handling with NAT-aware expiry
//! - A runtime configuration queue behind a local control socket
//!
//! ## Architecture
//!
//! SBC processes share state only through a key-value store
//! ([`store::KeyValueStore`]). Carrier configuration comes from a
//! [`directory::CarrierDirectory`], and SIP traffic goes through a
//! [`sip::SipClient`] provided by the embedding SIP stack. [`Sidecar`]
//! wires everything together.

pub mod config;
pub mod directory;
pub mod dns;
pub mod error;
pub mod logging;
pub mod options_ping;
pub mod presence;
pub mod regbot;
pub mod register;
pub mod registrar;
pub mod runtime_config;
pub mod services;
pub mod sidecar;
pub mod sip;
pub mod store;
pub mod telemetry;

pub use config::SidecarConfig;
pub use error::{Result, SidecarError};
pub use options_ping::{OptionsBot, OptionsPingFleet};
pub use presence::PresenceTracker;
pub use regbot::{Regbot, RegbotOrchestrator};
pub use register::InboundRegistrationHandler;
pub use registrar::{MemoryRegistrar, Registrar, StoreRegistrar};
pub use runtime_config::{ControlRequest, ControlResponse, FeatureServerConfig, RuntimeConfig};
pub use services::Services;
pub use sidecar::Sidecar;
