pub mod bridge;
pub mod bus;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod negotiate;
pub mod presence;
pub mod router;
pub mod server;
pub mod services;

pub use bus::{DeliveryBus, Envelope, LocalBus, Pumped, SqliteBus, Target};
pub use config::ServerConfig;
pub use error::ServerError;
pub use negotiate::{negotiate, Identity};
pub use server::{start, ServerHandle};
pub use services::Services;
