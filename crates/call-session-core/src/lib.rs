//! # Call Session Core - Call orchestration over a signaling transport
//!
//! This crate sits between an application (an agent desktop, a softphone
//! UI) and a real-time voice signaling client. It owns:
//!
//! - **Session lifecycle**: connect, register, logout, and automatic
//!   re-initialization after a call ends ([`SessionManager`])
//! - **Call registry**: the set of live calls keyed by call id, with
//!   deferred cleanup after eviction ([`CallRegistry`])
//! - **Reconciliation**: a polling monitor that keeps local call state in
//!   sync with the remote call list ([`CallMonitor`])
//! - **Call control**: mute, hold, resume, hangup, DTMF and transfer with
//!   push-based state updates ([`CallHandle`], [`CallUpdate`])
//! - **Duration tracking** per call and category ([`DurationTracker`])
//!
//! The wire protocol itself is behind the [`SignalingTransport`] trait.
//! [`LoopbackTransport`] is an in-process implementation for tests and
//! demos.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use call_session_core::{
//!     CallStatus, LoopbackTransport, ManagerSettings, SessionConfig, SessionManager,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> call_session_core::SessionResult<()> {
//! let transport = Arc::new(LoopbackTransport::new());
//! let settings = ManagerSettings::default().with_poll_interval(Duration::from_millis(20));
//! let manager = SessionManager::new(transport.clone(), settings);
//!
//! manager.initialize(SessionConfig::new("agent-42", "secret")).await?;
//! let call = manager.make_call("+15551234567").await?;
//! assert_eq!(call.status(), CallStatus::Connecting);
//!
//! // The far end answers; the monitor picks it up on its next tick
//! transport.set_status(call.id(), CallStatus::Connected);
//! tokio::time::sleep(Duration::from_millis(100)).await;
//! assert_eq!(call.status(), CallStatus::Connected);
//!
//! call.hold().await?;
//! assert!(call.is_on_hold());
//! call.hangup().await?;
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod config;
pub mod duration;
pub mod error;
pub mod events;
pub mod handle;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod recovery;
pub mod registry;
pub mod supervisor;
pub mod transport;

mod subscribers;

pub use call::{CallDirection, CallId, CallInfo, CallRecord, CallStatus};
pub use config::{
    normalize_destination, normalize_dtmf, HeaderValue, Headers, IceServer, ManagerSettings,
    SessionConfig,
};
pub use duration::DurationTracker;
pub use error::{ErrorKind, SessionError, SessionResult};
pub use events::{Availability, CallUpdate, SessionEvent, UpdateType};
pub use handle::CallHandle;
pub use logging::{setup_logging, LoggingConfig};
pub use manager::{SessionManager, SessionState, SessionStats};
pub use monitor::CallMonitor;
pub use recovery::{retry_with_backoff, with_timeout, ErrorContext, RetryConfig};
pub use registry::CallRegistry;
pub use subscribers::Subscription;
pub use supervisor::Supervisor;
pub use transport::loopback::LoopbackTransport;
pub use transport::{SignalingTransport, TransportConnection, TransportEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
