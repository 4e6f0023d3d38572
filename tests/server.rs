// End-to-end: client -> TCP server -> controller -> simulated hardware

use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use fiber_agitator::agitator::{AgitationController, AgitationRequest, ControllerState};
use fiber_agitator::client::{AgitatorClient, ClientError};
use fiber_agitator::config::{AgitationSettings, CalibrationConfig};
use fiber_agitator::messages::{self, Response};
use fiber_agitator::motor::SimulatedDriver;
use fiber_agitator::server;

async fn spawn_server(sim: &SimulatedDriver) -> (AgitatorClient, oneshot::Sender<()>) {
    let settings = AgitationSettings {
        poll_interval_secs: 0.01,
        stop_wait_secs: 0.01,
        ..Default::default()
    };
    let controller =
        AgitationController::new(sim.clone(), CalibrationConfig::default(), settings).unwrap();
    let controller = Arc::new(Mutex::new(controller));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(server::serve(listener, controller, async move {
        let _ = rx.await;
    }));

    (AgitatorClient::new("127.0.0.1", port), tx)
}

#[tokio::test]
async fn test_start_status_stop() {
    let sim = SimulatedDriver::new();
    let (client, _shutdown) = spawn_server(&sim).await;

    let status = client
        .start(AgitationRequest::new(30.0).with_rotations(6.0))
        .await
        .unwrap();
    assert_eq!(status.state, ControllerState::Running);
    assert_eq!(status.frequency, 0.2);
    assert!(status.voltage1 > 0.0 && status.voltage2 > 0.0);

    let status = client.status().await.unwrap();
    assert_eq!(status.state, ControllerState::Running);
    assert_eq!(status.battery_voltage, Some(12.0));

    let status = client.stop().await.unwrap();
    assert_eq!(status.state, ControllerState::Idle);
    assert_eq!((status.voltage1, status.voltage2), (0.0, 0.0));
    assert!(sim.state().is_stopped());
}

#[tokio::test]
async fn test_invalid_exposure_is_implicit_stop() {
    let sim = SimulatedDriver::new();
    let (client, _shutdown) = spawn_server(&sim).await;

    let status = client.start(AgitationRequest::new(-1.0)).await.unwrap();
    assert_eq!(status.state, ControllerState::Idle);
    assert_eq!(status.voltage1, 0.0);
}

#[tokio::test]
async fn test_hardware_fault_reaches_client() {
    let sim = SimulatedDriver::new();
    let (client, _shutdown) = spawn_server(&sim).await;
    sim.state().fail_battery_reads = 1;

    let err = client.start(AgitationRequest::new(5.0)).await.unwrap_err();
    assert!(matches!(err, ClientError::Remote(_)));
    assert!(sim.state().is_stopped());
}

#[tokio::test]
async fn test_malformed_request_gets_error_reply() {
    let sim = SimulatedDriver::new();
    let (client, _shutdown) = spawn_server(&sim).await;

    let mut stream = tokio::net::TcpStream::connect(client.addr()).await.unwrap();
    messages::write_frame(&mut stream, br#"{"method": "dance"}"#)
        .await
        .unwrap();
    let reply: Response = messages::recv(&mut stream).await.unwrap();
    assert!(matches!(reply, Response::Error(_)));
}
