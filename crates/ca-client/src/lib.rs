//! # ca-client
//!
//! Client-side Channel Access discovery: register with the host's repeater,
//! then resolve names to server addresses by broadcasting searches.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use ca_client::{ClientConfig, ClientDiscoveryContext, UdpTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::default();
//! let transport = UdpTransport::bind("0.0.0.0:0".parse()?).await?;
//! let context = ClientDiscoveryContext::start(transport, &config)?;
//! context.register().await?;
//! let server = context.resolve("XF:31IDA-OP{Tbl-Ax:X1}Mtr", Duration::from_millis(500)).await?;
//! println!("served by {server}");
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod infrastructure;

pub use application::discovery_context::{
    BeaconEvent, ClientDiscoveryContext, DiscoveryError, SearchCanceller, SearchHandle,
};
pub use infrastructure::config::{load_config, ClientConfig, ConfigError, RetrySection};
pub use infrastructure::transport::{DatagramTransport, TransportError, UdpTransport};
