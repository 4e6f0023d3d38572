// Fiber agitator: dual-channel DC motor control over a Roboclaw controller

pub mod agitator;
pub mod client;
pub mod config;
pub mod messages;
pub mod motor;
pub mod server;
