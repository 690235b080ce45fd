//! Networking for the sync engine
//!
//! This crate provides connectivity monitoring, retry schedules, the remote
//! state port with its HTTP adapter, and the realtime change-channel port.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connectivity;
pub mod realtime;
pub mod remote;
pub mod retry;

pub use connectivity::{
    ConnectivityMonitor, ConnectivityProbe, ConnectivitySignal, ConnectivityStatus, ManualSignal,
    PlatformEvent,
};
pub use realtime::{
    ChangeCallback, ChangeEvent, LocalRealtimeHub, RealtimeChannel, RealtimeError,
    SubscriptionHandle,
};
pub use remote::{
    Conflict, HttpRemoteState, MutationKind, PushOutcome, RemoteConfig, RemoteError,
    RemoteMutation, RemoteState, RemoteStateApi,
};
pub use retry::{retry, BackoffSchedule, RetryPolicy};
