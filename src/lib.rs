//! MQTT edge gateway: keeps sessions to a set of upstream brokers and runs
//! protocol modules (currently an HTTP bridge) that publish through them.

pub mod broker;
pub mod config;
pub mod gateway;
pub mod http_bridge;
pub mod models;

pub use config::Config;
pub use gateway::{Gateway, GatewayError, ModuleContext, ModuleError, ProtocolModule};
