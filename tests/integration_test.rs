use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::sleep,
};

use shelly_em_grid_meter::{
    grid_meter::{DeviceInfo, AC_CURRENT, AC_ENERGY_FORWARD, AC_ENERGY_REVERSE, AC_POWER},
    ChangePublisher, GridMeter, MeterPoller, Phase, SharedMeter, ShellyEmApi, UpdateHandler,
};

/// Mock Shelly EM serving `/status`
struct MockShellyServer {
    power: Mutex<f64>,
    voltage: Mutex<f64>,
    total: Mutex<f64>,
    total_returned: Mutex<f64>,
    request_count: AtomicU32,
    should_fail: AtomicBool,
}

impl MockShellyServer {
    fn new() -> Self {
        Self {
            power: Mutex::new(0.0),
            voltage: Mutex::new(230.0),
            total: Mutex::new(0.0),
            total_returned: Mutex::new(0.0),
            request_count: AtomicU32::new(0),
            should_fail: AtomicBool::new(false),
        }
    }

    fn set_power(&self, power: f64) {
        *self.power.lock().unwrap() = power;
    }

    fn set_voltage(&self, voltage: f64) {
        *self.voltage.lock().unwrap() = voltage;
    }

    fn set_energy(&self, total: f64, total_returned: f64) {
        *self.total.lock().unwrap() = total;
        *self.total_returned.lock().unwrap() = total_returned;
    }

    fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::Relaxed);
    }

    fn get_request_count(&self) -> u32 {
        self.request_count.load(Ordering::Relaxed)
    }

    fn create_router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/status", get(status_handler))
            .with_state(self)
    }
}

async fn status_handler(
    State(server): State<Arc<MockShellyServer>>,
) -> Result<Json<Value>, StatusCode> {
    server.request_count.fetch_add(1, Ordering::Relaxed);

    if server.should_fail.load(Ordering::Relaxed) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    Ok(Json(json!({
        "mac": "C45BBE7A1B2C",
        "emeters": [{
            "power": *server.power.lock().unwrap(),
            "reactive": 0.0,
            "voltage": *server.voltage.lock().unwrap(),
            "is_valid": true,
            "total": *server.total.lock().unwrap(),
            "total_returned": *server.total_returned.lock().unwrap()
        }]
    })))
}

async fn start_mock_shelly_server() -> (Arc<MockShellyServer>, SocketAddr, oneshot::Sender<()>) {
    let mock_server = Arc::new(MockShellyServer::new());
    let app = mock_server.clone().create_router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    tokio::spawn(async move {
        let server = axum::serve(listener, app);
        tokio::select! {
            _ = server => {},
            _ = shutdown_rx => {
                println!("Mock Shelly server shutting down");
            }
        }
    });

    (mock_server, addr, shutdown_tx)
}

/// Stands in for the bus, counts publications
#[derive(Clone, Default)]
struct CountingPublisher {
    publications: Arc<AtomicU32>,
}

#[async_trait]
impl ChangePublisher for CountingPublisher {
    async fn publish(&self, _paths: &[String]) -> anyhow::Result<()> {
        self.publications.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

async fn start_bridge(addr: SocketAddr, phase: Phase) -> (SharedMeter, CountingPublisher) {
    let api = ShellyEmApi::new(&addr.to_string(), "", "", 0);
    let serial = api.fetch_serial().await.expect("Mock Shelly should answer");

    let meter = GridMeter::new(
        &DeviceInfo {
            device_instance: 40,
            custom_name: "Shelly EM".to_string(),
            serial,
        },
        phase,
    )
    .into_shared();
    let publisher = CountingPublisher::default();

    let (tx, rx) = mpsc::channel(32);
    UpdateHandler::new(meter.clone(), publisher.clone()).spawn(rx);
    MeterPoller::new(api, Duration::from_millis(50), tx).spawn();

    (meter, publisher)
}

#[tokio::test]
async fn test_full_integration() {
    let (mock_shelly, shelly_addr, _shutdown) = start_mock_shelly_server().await;

    mock_shelly.set_power(920.0);
    mock_shelly.set_voltage(230.0);
    mock_shelly.set_energy(1_500_000.0, 250_000.0);

    let (meter, publisher) = start_bridge(shelly_addr, Phase::L2).await;
    sleep(Duration::from_millis(500)).await;

    // Test 1: readings land on the configured phase, totals follow
    {
        let meter = meter.lock().await;
        assert_eq!(
            meter.value("/Serial").map(|v| v.to_string()),
            Some("C45BBE7A1B2C".to_string())
        );
        assert_eq!(meter.number("/Ac/L2/Power"), 920.0);
        assert_eq!(meter.number("/Ac/L2/Current"), 4.0);
        assert_eq!(meter.number("/Ac/L1/Power"), 0.0);
        assert_eq!(meter.number("/Ac/L3/Voltage"), 0.0);
        assert_eq!(meter.number(AC_POWER), 920.0);
        assert_eq!(meter.number(AC_CURRENT), 4.0);
        assert_eq!(meter.number(AC_ENERGY_FORWARD), 1500.0);
        assert_eq!(meter.number(AC_ENERGY_REVERSE), 250.0);
        assert!(meter.update_index() > 2);
    }

    // Test 2: updates propagate, exporting shows as negative power
    mock_shelly.set_power(-460.0);
    sleep(Duration::from_millis(300)).await;
    {
        let meter = meter.lock().await;
        assert_eq!(meter.number(AC_POWER), -460.0);
        assert_eq!(meter.number(AC_CURRENT), -2.0);
    }

    // Test 3: failed polls leave the last values in place
    mock_shelly.set_should_fail(true);
    sleep(Duration::from_millis(200)).await;
    let (index_during_failure, published_during_failure) = {
        let meter = meter.lock().await;
        (
            meter.update_index(),
            publisher.publications.load(Ordering::Relaxed),
        )
    };
    sleep(Duration::from_millis(300)).await;
    {
        let meter = meter.lock().await;
        assert_eq!(meter.update_index(), index_during_failure);
        assert_eq!(meter.number(AC_POWER), -460.0);
        assert_eq!(
            publisher.publications.load(Ordering::Relaxed),
            published_during_failure
        );
    }

    // Test 4: recovery on the next tick after the meter answers again
    mock_shelly.set_should_fail(false);
    mock_shelly.set_power(115.0);
    sleep(Duration::from_millis(300)).await;
    {
        let meter = meter.lock().await;
        assert_eq!(meter.number(AC_POWER), 115.0);
        assert_eq!(meter.number(AC_CURRENT), 0.5);
    }

    assert!(
        mock_shelly.get_request_count() > 10,
        "Expected the meter to be polled repeatedly, got {} requests",
        mock_shelly.get_request_count()
    );
}

#[tokio::test]
async fn test_zero_voltage_tick_is_skipped() {
    let (mock_shelly, shelly_addr, _shutdown) = start_mock_shelly_server().await;
    mock_shelly.set_power(230.0);

    let (meter, _publisher) = start_bridge(shelly_addr, Phase::L1).await;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(meter.lock().await.number(AC_CURRENT), 1.0);

    mock_shelly.set_voltage(0.0);
    mock_shelly.set_power(500.0);
    sleep(Duration::from_millis(300)).await;

    let meter = meter.lock().await;
    assert_eq!(meter.number(AC_POWER), 230.0);
    assert_eq!(meter.number(AC_CURRENT), 1.0);
}
