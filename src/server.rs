// TCP server forwarding remote start/stop calls to the agitation controller
//
// One framed request per connection. Controller calls block (stop waits for
// the agitation thread), so they run on the blocking pool.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::agitator::AgitationController;
use crate::messages::{self, ProtocolError, Request, Response};
use crate::motor::DriverPort;

pub type SharedController<D> = Arc<Mutex<AgitationController<D>>>;

/// Apply one request to the controller
pub fn dispatch<D: DriverPort + 'static>(
    controller: &mut AgitationController<D>,
    request: Request,
) -> Response {
    let outcome = match request {
        Request::StartAgitation(params) => controller.start(params),
        Request::StopAgitation => controller.stop(),
        Request::Status => Ok(()),
    };

    match outcome {
        Ok(()) => Response::Result(controller.status()),
        Err(e) => {
            warn!("Request failed: {}", e);
            Response::Error(e.to_string())
        }
    }
}

async fn handle_connection<D: DriverPort + 'static>(
    mut stream: TcpStream,
    controller: SharedController<D>,
) -> Result<(), ProtocolError> {
    let request: Request = match messages::recv(&mut stream).await {
        Ok(request) => request,
        Err(ProtocolError::Json(e)) => {
            let reply = Response::Error(format!("Invalid request: {}", e));
            return messages::send(&mut stream, &reply).await;
        }
        Err(e) => return Err(e),
    };
    debug!("Received request: {:?}", request);

    let response = tokio::task::spawn_blocking(move || {
        let mut controller = controller.lock().unwrap_or_else(PoisonError::into_inner);
        dispatch(&mut controller, request)
    })
    .await
    .unwrap_or_else(|e| Response::Error(format!("Controller call failed: {}", e)));

    messages::send(&mut stream, &response).await
}

/// Accept connections until `shutdown` resolves
pub async fn serve<D, F>(
    listener: TcpListener,
    controller: SharedController<D>,
    shutdown: F,
) -> std::io::Result<()>
where
    D: DriverPort + 'static,
    F: Future<Output = ()>,
{
    info!("Agitator server listening on {}", listener.local_addr()?);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!("Connection from {}", peer);
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, controller).await {
                        warn!("Connection from {} failed: {}", peer, e);
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Stopping agitator server");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agitator::{AgitationRequest, ControllerState};
    use crate::config::{AgitationSettings, CalibrationConfig};
    use crate::motor::SimulatedDriver;

    fn controller(sim: &SimulatedDriver) -> AgitationController<SimulatedDriver> {
        let settings = AgitationSettings {
            poll_interval_secs: 0.01,
            stop_wait_secs: 0.01,
            ..Default::default()
        };
        AgitationController::new(sim.clone(), CalibrationConfig::default(), settings).unwrap()
    }

    #[test]
    fn test_dispatch_start_and_stop() {
        let sim = SimulatedDriver::new();
        let mut ctl = controller(&sim);

        let reply = dispatch(
            &mut ctl,
            Request::StartAgitation(AgitationRequest::new(30.0).with_frequency(0.1)),
        );
        let status = match reply {
            Response::Result(status) => status,
            Response::Error(e) => panic!("start failed: {}", e),
        };
        assert_eq!(status.state, ControllerState::Running);
        assert!(status.voltage1 > 0.0);
        assert_eq!(status.battery_voltage, Some(12.0));

        let status = match dispatch(&mut ctl, Request::StopAgitation) {
            Response::Result(status) => status,
            Response::Error(e) => panic!("stop failed: {}", e),
        };
        assert_eq!(status.state, ControllerState::Idle);
        assert_eq!((status.voltage1, status.voltage2), (0.0, 0.0));
    }

    #[test]
    fn test_dispatch_reports_hardware_fault() {
        let sim = SimulatedDriver::new();
        let mut ctl = controller(&sim);
        sim.state().fail_battery_reads = 1;

        let reply = dispatch(&mut ctl, Request::StartAgitation(AgitationRequest::new(5.0)));
        assert!(matches!(reply, Response::Error(_)));
    }
}
