//! VPN session manager, sensor scheduler, credential rotation, and alert
//! engine for the monitoring backend. This crate has no HTTP surface of its
//! own — `m360-web` owns the axum app and borrows a [`runtime::Runtime`].

pub mod alert;
pub mod config;
pub mod connectivity;
pub mod events;
pub mod netadmin;
pub mod peer;
pub mod reachability;
pub mod ros;
pub mod rotation;
pub mod runtime;
pub mod scheduler;
pub mod vpn;
pub mod wgconfig;

pub use alert::{AlertEngine, Notifier, NullNotifier};
pub use config::Config;
pub use events::EventBus;
pub use netadmin::{FakeNetAdmin, NetAdmin, ShellNetAdmin};
pub use peer::{PeerRegistrar, PeerStatus, RegisterPeerRequest, RegisteredPeer};
pub use reachability::{ReachabilityProbe, ReachabilityRequest, ReachabilityResult};
pub use ros::{BlockingRouterOsConnector, RouterOsClient, RouterOsConnector, RouterOsPool};
pub use rotation::CredentialRotator;
pub use runtime::Runtime;
pub use scheduler::SensorScheduler;
pub use vpn::VpnManager;
