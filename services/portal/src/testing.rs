//! Test doubles for the bus and the payment processor

use async_trait::async_trait;
use common::error::{BusError, BusResult};
use common::mqtt::Publisher;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::payment::{
    CardOnFile, ChargeRequest, Hold, HoldRequest, PaymentError, PaymentProcessor, PaymentResult,
    Settlement,
};

/// Records every publish while "connected"
pub struct RecordingBus {
    connected: AtomicBool,
    published: Mutex<Vec<(String, Value)>>,
}

impl RecordingBus {
    pub fn connected() -> Self {
        Self {
            connected: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn disconnected() -> Self {
        let bus = Self::connected();
        bus.set_connected(false);
        bus
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl Publisher for RecordingBus {
    async fn publish(&self, topic: &str, payload: &Value) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload.clone()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// A scripted failure for the next call of one kind
#[derive(Debug, Clone)]
pub enum Fault {
    Decline(String),
    Unavailable(String),
    /// Do the work, then hang past any sane timeout
    Stall,
}

#[derive(Default)]
struct Ledger {
    holds: HashMap<String, String>,
    authorize_calls: usize,
    captures: Vec<(String, i64)>,
    voids: Vec<String>,
    charges: Vec<(String, i64, String)>,
    authorize_fault: Option<Fault>,
    capture_fault: Option<Fault>,
    void_fault: Option<Fault>,
    latency: Duration,
}

/// In-memory processor; holds are keyed by idempotency key like the real one
#[derive(Default)]
pub struct FakeProcessor {
    ledger: Mutex<Ledger>,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next_authorize(&self, fault: Fault) {
        self.ledger.lock().await.authorize_fault = Some(fault);
    }

    pub async fn fail_next_capture(&self, fault: Fault) {
        self.ledger.lock().await.capture_fault = Some(fault);
    }

    pub async fn fail_next_void(&self, fault: Fault) {
        self.ledger.lock().await.void_fault = Some(fault);
    }

    /// Delay every authorize, capture and void by `latency`
    pub async fn set_latency(&self, latency: Duration) {
        self.ledger.lock().await.latency = latency;
    }

    pub async fn hold_count(&self) -> usize {
        self.ledger.lock().await.holds.len()
    }

    pub async fn authorize_calls(&self) -> usize {
        self.ledger.lock().await.authorize_calls
    }

    pub async fn captures(&self) -> Vec<(String, i64)> {
        self.ledger.lock().await.captures.clone()
    }

    pub async fn voids(&self) -> Vec<String> {
        self.ledger.lock().await.voids.clone()
    }

    pub async fn charges(&self) -> Vec<(String, i64, String)> {
        self.ledger.lock().await.charges.clone()
    }
}

async fn apply<T>(fault: Option<Fault>, latency: Duration, ok: T) -> PaymentResult<T> {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
    match fault {
        None => Ok(ok),
        Some(Fault::Decline(reason)) => Err(PaymentError::Declined(reason)),
        Some(Fault::Unavailable(reason)) => Err(PaymentError::Unavailable(reason)),
        Some(Fault::Stall) => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ok)
        }
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn authorize(&self, request: &HoldRequest) -> PaymentResult<Hold> {
        let (hold, fault, latency) = {
            let mut ledger = self.ledger.lock().await;
            ledger.authorize_calls += 1;
            let fault = ledger.authorize_fault.take();
            if let Some(Fault::Decline(reason)) = &fault {
                return Err(PaymentError::Declined(reason.clone()));
            }
            let next = format!("H{}", ledger.holds.len() + 1);
            let hold_id = ledger
                .holds
                .entry(request.idempotency_key.clone())
                .or_insert(next)
                .clone();
            (hold_id, fault, ledger.latency)
        };

        let card = CardOnFile {
            customer_id: Some("CUST1".into()),
            card_id: Some("CARD1".into()),
            brand: Some("VISA".into()),
            last4: Some("1111".into()),
        };
        apply(fault, latency, Hold { hold_id: hold, card }).await
    }

    async fn capture(&self, hold_id: &str, amount_cents: i64) -> PaymentResult<Settlement> {
        let (fault, latency) = {
            let mut ledger = self.ledger.lock().await;
            let fault = ledger.capture_fault.take();
            if !matches!(fault, Some(Fault::Decline(_)) | Some(Fault::Unavailable(_))) {
                ledger.captures.push((hold_id.to_string(), amount_cents));
            }
            (fault, ledger.latency)
        };
        apply(
            fault,
            latency,
            Settlement {
                payment_id: hold_id.to_string(),
                amount_cents,
            },
        )
        .await
    }

    async fn void(&self, hold_id: &str) -> PaymentResult<Settlement> {
        let (fault, latency) = {
            let mut ledger = self.ledger.lock().await;
            let fault = ledger.void_fault.take();
            if !matches!(fault, Some(Fault::Decline(_)) | Some(Fault::Unavailable(_))) {
                ledger.voids.push(hold_id.to_string());
            }
            (fault, ledger.latency)
        };
        apply(
            fault,
            latency,
            Settlement {
                payment_id: hold_id.to_string(),
                amount_cents: 0,
            },
        )
        .await
    }

    async fn charge(&self, request: &ChargeRequest) -> PaymentResult<Settlement> {
        let mut ledger = self.ledger.lock().await;
        let already = ledger
            .charges
            .iter()
            .any(|(_, _, key)| key == &request.idempotency_key);
        if !already {
            ledger.charges.push((
                request.card_id.clone(),
                request.amount_cents,
                request.idempotency_key.clone(),
            ));
        }
        Ok(Settlement {
            payment_id: format!("CH-{}", request.idempotency_key),
            amount_cents: request.amount_cents,
        })
    }
}

/// A fully wired portal over in-memory collaborators
pub struct TestApp {
    pub state: crate::state::AppState,
    pub processor: std::sync::Arc<FakeProcessor>,
    pub bus: std::sync::Arc<RecordingBus>,
}

pub const TEST_ADMIN_PASSWORD: &str = "hunter2";

impl TestApp {
    pub fn new(response_timeout: Duration) -> Self {
        use crate::booking::BookingBroker;
        use crate::lifecycle::{EngineSettings, LifecycleEngine};
        use crate::middleware::AdminAuth;
        use crate::repositories::memory::MemorySessionStore;
        use crate::state::{AppState, SquareInfo};
        use std::sync::Arc;

        let store = Arc::new(MemorySessionStore::new());
        let processor = Arc::new(FakeProcessor::new());
        let bus = Arc::new(RecordingBus::connected());
        let settings = EngineSettings {
            processor_timeout: Duration::from_millis(200),
            ..EngineSettings::default()
        };
        let engine = LifecycleEngine::new(store, processor.clone(), bus.clone(), settings);
        let booking = BookingBroker::new(bus.clone(), response_timeout, 100);

        let state = AppState {
            engine,
            booking,
            bus: bus.clone(),
            home_id: "h1".into(),
            charger_id: "c1".into(),
            response_timeout,
            square: SquareInfo {
                app_id: "sandbox-sq0idb-app".into(),
                location_id: "LOC1".into(),
                sdk_url: "https://sandbox.web.squarecdn.com/v1/square.js".into(),
            },
            admin: Some(AdminAuth::new("admin", TEST_ADMIN_PASSWORD)),
        };
        Self {
            state,
            processor,
            bus,
        }
    }

    /// Wait until something was published on a topic ending with `suffix`
    pub async fn wait_for_publish(&self, suffix: &str) -> Value {
        loop {
            if let Some((_, payload)) = self
                .bus
                .published()
                .await
                .into_iter()
                .find(|(topic, _)| topic.ends_with(suffix))
            {
                return payload;
            }
            tokio::task::yield_now().await;
        }
    }
}
