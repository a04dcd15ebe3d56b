//! kifulab server: the coordination layer over `kifulab-core`
//!
//! This crate wires the domain core to the outside world:
//! - **Store**: SQLite persistence for games, nodes, snapshots, app state
//! - **Supervisor**: the USI engine child process and its protocol
//! - **Analysis**: cadence-limited streaming of engine evaluations
//! - **Session**: the single-owner slot and freshness tokens
//! - **Sync**: the single-writer task every mutation flows through
//! - **Server**: axum REST surface plus the WebSocket channel

pub mod analysis;
pub mod server;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod wire;

pub use analysis::AnalysisCoordinator;
pub use server::AppState;
pub use session::SessionHub;
pub use store::SqliteStore;
pub use supervisor::UsiSupervisor;
pub use sync::{Intent, OutboundFrame, SyncHandle, Synchronizer};
pub use wire::{ClientEnvelope, ServerMessage};
