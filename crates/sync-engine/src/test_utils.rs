//! Shared fakes for sync engine tests

#![allow(dead_code)]

use crate::adapter::{AppStateAdapter, RestoreReport};
use async_trait::async_trait;
use mockall::mock;
use networking::{
    ConnectivityProbe, PushOutcome, RemoteError, RemoteMutation, RemoteState, RemoteStateApi,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

mock! {
    pub Remote {}

    #[async_trait]
    impl RemoteStateApi for Remote {
        async fn fetch_remote_state(
            &self,
            user_id: &str,
        ) -> Result<Option<RemoteState>, RemoteError>;
        async fn push_remote_state(
            &self,
            user_id: &str,
            state: &Value,
            version: Option<u64>,
        ) -> Result<PushOutcome, RemoteError>;
        async fn apply_mutation(
            &self,
            user_id: &str,
            mutation: &RemoteMutation,
        ) -> Result<(), RemoteError>;
    }
}

/// Connectivity probe flipped by the test
pub struct Probe(AtomicBool);

impl Probe {
    pub fn new(offline: bool) -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(offline)))
    }

    pub fn set_offline(&self, offline: bool) {
        self.0.store(offline, Ordering::SeqCst);
    }
}

impl ConnectivityProbe for Probe {
    fn is_offline(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The pet state every capture returns
pub fn pet_state() -> Value {
    json!({ "coins": 120, "pet": { "name": "Biscuit", "hunger": 40 } })
}

/// Application adapter recording what it was asked to restore
#[derive(Default)]
pub struct FakeApp {
    pub captures: AtomicUsize,
    pub restored: Mutex<Vec<Value>>,
}

#[async_trait]
impl AppStateAdapter for FakeApp {
    async fn capture_app_state(&self, _user_id: &str) -> anyhow::Result<Value> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(pet_state())
    }

    async fn restore_app_state(
        &self,
        _user_id: &str,
        snapshot: &Value,
    ) -> anyhow::Result<RestoreReport> {
        self.restored.lock().push(snapshot.clone());
        Ok(RestoreReport::applied())
    }
}

pub fn outcome(version: u64) -> PushOutcome {
    PushOutcome {
        state: pet_state(),
        conflicts: vec![],
        version,
    }
}

pub fn network_error() -> RemoteError {
    RemoteError::Network("connection reset".to_string())
}
