use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tickets::prelude::*;
use tickets::service::register_infrastructure;
use tickets_core::events::BookingMade;
use tickets_mem::{InMemoryBroker, InMemoryDataLake, InMemoryOpsBookings, InMemoryOutbox};
use tokio::time::timeout;
use uuid::Uuid;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

fn fast_forwarder() -> ForwarderConfig {
    ForwarderConfig {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

struct Relay {
    outbox: Arc<InMemoryOutbox>,
    data_lake: Arc<InMemoryDataLake>,
    bookings: Arc<InMemoryOpsBookings>,
    service: Service<InMemoryOutbox>,
}

fn relay() -> Relay {
    let broker = Arc::new(InMemoryBroker::new());
    let outbox = Arc::new(InMemoryOutbox::new());
    let data_lake = Arc::new(InMemoryDataLake::new());
    let bookings = Arc::new(InMemoryOpsBookings::new());

    let mut router = Router::with_standard_middlewares(RouterConfig::default(), broker.clone());
    register_infrastructure(
        &mut router,
        broker.clone(),
        data_lake.clone(),
        bookings.clone(),
    )
    .unwrap();
    let forwarder = Forwarder::new(outbox.clone(), broker, fast_forwarder());

    Relay {
        outbox,
        data_lake,
        bookings,
        service: Service::new(router, forwarder),
    }
}

#[tokio::test]
async fn infrastructure_handlers_are_registered_once() {
    let broker = Arc::new(InMemoryBroker::new());
    let mut router = Router::new(RouterConfig::default(), broker.clone());
    register_infrastructure(
        &mut router,
        broker.clone(),
        Arc::new(InMemoryDataLake::new()),
        InMemoryOpsBookings::new(),
    )
    .unwrap();

    let names = router.handler_names();
    assert!(names.contains(&"events_splitter"));
    assert!(names.contains(&"store_to_data_lake"));
    assert!(names.contains(&"ops_read_model.OnBookingMade"));
    assert!(names.contains(&"ops_read_model.OnTicketReceiptIssued"));

    let again = register_infrastructure(
        &mut router,
        broker.clone(),
        Arc::new(InMemoryDataLake::new()),
        InMemoryOpsBookings::new(),
    );
    assert!(matches!(again, Err(RouterError::DuplicateHandler(_))));
}

#[tokio::test]
async fn service_relays_outbox_events_until_shutdown() {
    init_logger();
    let Relay {
        outbox,
        data_lake,
        bookings,
        service,
    } = relay();

    let readiness = service.readiness();
    let trigger = service.shutdown_trigger();
    let handle = tokio::spawn(service.run());

    timeout(Duration::from_secs(5), readiness.wait())
        .await
        .expect("service should become ready");

    let booking_id = Uuid::new_v4();
    let event = TicketsEvent::BookingMade(BookingMade {
        header: MessageHeader::new(),
        number_of_tickets: 1,
        booking_id,
        customer_email: "email@example.com".to_string(),
        show_id: Uuid::new_v4(),
    });
    let mut tx = outbox.begin().await.unwrap();
    OutboxEventBus::new(&*outbox)
        .publish(&mut tx, &event)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    eventually(|| async { bookings.find_by_id(booking_id).await.is_ok() }).await;
    eventually(|| async { data_lake.events().await.unwrap().len() == 1 }).await;

    trigger.trigger();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("service should stop")
        .unwrap()
        .unwrap();
    assert!(!readiness.is_ready());
}

struct Unreachable;

#[async_trait]
impl Subscriber for Unreachable {
    async fn subscribe(&self, _topic: &str, _group: &str) -> Result<DeliveryStream, BrokerError> {
        Err(BrokerError::Closed)
    }
}

#[tokio::test]
async fn service_fails_when_the_router_cannot_subscribe() {
    init_logger();
    let broker = Arc::new(InMemoryBroker::new());
    let mut router = Router::new(RouterConfig::default(), broker.clone());
    router
        .add_handler(
            "events_splitter",
            EVENTS_TOPIC,
            Arc::new(Unreachable),
            EventsSplitter,
        )
        .unwrap();
    let forwarder = Forwarder::new(Arc::new(InMemoryOutbox::new()), broker, fast_forwarder());

    let result = timeout(Duration::from_secs(5), Service::new(router, forwarder).run())
        .await
        .expect("service should stop on its own");
    assert!(matches!(
        result,
        Err(ServiceError::Router(RouterError::Subscribe { .. }))
    ));
}
