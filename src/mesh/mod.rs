//! Mesh daemon integration
//!
//! Everything between this plugin and the WireGuard overlay: the control
//! socket client, the daemon supervisor, the route registry, and the
//! auth/connect state machine.

pub mod api;
pub mod client;
pub mod connect;
pub mod probe;
pub mod routes;
pub mod supervisor;

pub use api::{BackendState, MaskedPrefs, Prefs, PrefsTarget, Status};
pub use client::{redact_key, MeshClient, SYSTEM_SOCKET_PATH};
pub use connect::{ConnectStateMachine, UpOptions, AUTH_KEY_AUTO};
pub use probe::{probe_control_plane, ProbeReport};
pub use routes::{derive_pool_cidr, RouteBackup, RouteRecord, RouteRegistry, RouteStatistics};
pub use supervisor::{
    MeshSupervisor, ServiceInfo, ServiceMode, ServiceOptions, ServiceState, OWNED_SOCKET_PATH,
};
