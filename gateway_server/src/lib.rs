// Sensor Seal Gateway Server — embeddable server core.
//
// The binary in `main.rs` is the stock application: it loads the
// authorized-gateway table, runs the server, and logs decoded telemetry.
// Other applications embed `GatewayServer` directly and install their own
// hooks from `on_connection`.
pub mod client;
pub mod config;
pub mod server;

pub use client::{Client, ClientSender};
pub use config::{Cli, GatewayTable};
pub use server::GatewayServer;
