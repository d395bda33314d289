#![deny(rust_2018_idioms)]

mod config;
mod core;
#[cfg(feature = "cli")]
mod daemon;
mod dispatch;
mod error;
mod http;
mod inhibit;
mod label;
mod matcher;
mod metrics;
mod nflog;
mod notifier;
mod peer;
mod pipeline;
mod provider;
mod route;
mod silence;
mod snapshot;
mod time_window;

pub use config::{Config, GlobalConfig};
pub use core::{AlertFilter, AlertGroup, Core, SnapshotPaths};
#[cfg(feature = "cli")]
pub use daemon::{run, DaemonConfig};
pub use error::{Error, MultiError, Result};
pub use inhibit::InhibitRuleConfig;
pub use label::{Alert, LabelSet};
pub use matcher::{MatchKind, Matcher};
pub use notifier::{EmailConfig, Notifier, WebhookConfig};
pub use peer::{ClusterPeer, GossipChannel, LocalGossip, LocalPeer, PeerStatus};
pub use provider::{AlertProvider, InMemoryProvider};
pub use route::{GroupBy, RouteConfig, RouteTree};
pub use silence::{Silence, SilenceFilter, SilenceState};
pub use time_window::TimeInterval;
