#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tickets_core::prelude::*;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Retries quickly so tests do not wait on real backoff.
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(5),
        multiplier: 2.0,
        jitter: false,
    }
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

pub struct RunningRouter {
    trigger: ShutdownTrigger,
    handle: JoinHandle<Result<(), RouterError>>,
}

impl RunningRouter {
    pub async fn start(router: Router) -> Self {
        let running = router.running();
        let (trigger, shutdown) = shutdown_channel();
        let handle = tokio::spawn(router.run(shutdown));
        running.wait().await;
        Self { trigger, handle }
    }

    pub async fn stop(self) {
        self.trigger.trigger();
        self.handle.await.unwrap().unwrap();
    }
}

#[derive(Default)]
pub struct RecordedAlerts(Mutex<Vec<Alert>>);

impl RecordedAlerts {
    pub async fn all(&self) -> Vec<Alert> {
        self.0.lock().await.clone()
    }
}

#[async_trait]
impl AlertCallback for RecordedAlerts {
    async fn on_alert(&self, alert: &Alert) {
        self.0.lock().await.push(alert.clone());
    }
}

/// A handler that counts calls and answers with a fixed result.
pub struct Scripted {
    pub calls: Arc<AtomicUsize>,
    pub respond: fn(&Envelope) -> HandlerResult,
}

impl Scripted {
    pub fn new(respond: fn(&Envelope) -> HandlerResult) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: calls.clone(),
                respond,
            },
            calls,
        )
    }
}

#[async_trait]
impl Handler for Scripted {
    async fn handle(&self, _ctx: MessageContext, envelope: &Envelope) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(envelope)
    }
}

pub fn confirmed(booking_id: Uuid, ticket_id: Uuid) -> TicketsEvent {
    TicketsEvent::TicketBookingConfirmed(tickets_core::events::TicketBookingConfirmed {
        header: MessageHeader::new(),
        ticket_id,
        customer_email: "email@example.com".to_string(),
        price: Money {
            amount: "50.30".to_string(),
            currency: "EUR".to_string(),
        },
        booking_id,
    })
}

pub fn booking_made(booking_id: Uuid, show_id: Uuid) -> TicketsEvent {
    TicketsEvent::BookingMade(tickets_core::events::BookingMade {
        header: MessageHeader::new(),
        number_of_tickets: 2,
        booking_id,
        customer_email: "email@example.com".to_string(),
        show_id,
    })
}
