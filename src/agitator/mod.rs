// Agitation control: request planning and the stateful controller

pub mod controller;
pub mod request;

pub use controller::{AgitationController, AgitatorError, ControllerState, StopReason};
pub use request::{AgitationPlan, AgitationRequest, InvalidRequest};
