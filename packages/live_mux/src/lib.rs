//! # live_mux
//!
//! Client-side live-update multiplexer for agent conversations.
//!
//! An agent backend exposes two sources of truth about a running
//! conversation: a pull-based historical record (REST) and a push-based live
//! event stream (one shared WebSocket). This crate reconciles them:
//!
//! - [`connection::ConnectionManager`] owns the single realtime connection —
//!   connect, reset, automatic fixed-delay reconnect, and re-announcement of
//!   the full interest set after every reconnect.
//! - [`registry::UpdateMux`] multiplexes that connection across
//!   per-conversation listeners and folds tool envelopes into invocation
//!   state as they arrive.
//! - [`history::HistoryClient`] fetches persisted conversations and sends
//!   messages; its stored actions seed the same folded state for
//!   conversations whose history predates the connection.
//!
//! The data model and the pure fold/merge logic live in the `agent_events`
//! crate.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use live_mux::config::{FileConfig, MuxConfig};
//! use live_mux::registry::UpdateMux;
//!
//! # async fn example() {
//! let config = MuxConfig::from_file(&FileConfig::default());
//! let mux = UpdateMux::new(&config);
//!
//! let guard = mux.subscribe("conversation-1", |envelope| {
//!     println!("{:?} {:?}", envelope.kind, envelope.tool);
//! });
//!
//! // ... later: the merged, render-ready view.
//! let timeline = mux.get_timeline("conversation-1");
//! drop(timeline);
//! guard.unsubscribe();
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod history;
pub mod registry;

pub use config::{FileConfig, MuxConfig, load_config};
pub use connection::ConnectionManager;
pub use history::{HistoryClient, HistoryError};
pub use registry::{Listener, ListenerGuard, UpdateMux};
