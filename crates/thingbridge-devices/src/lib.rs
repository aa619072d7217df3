//! ThingBridge Devices
//!
//! Connects stored things to a publish/subscribe transport:
//!
//! - [`registry`]: thing registry on top of a storage driver, with change notifiers
//! - [`transport`]: the transport contract, an MQTT implementation and a loopback
//! - [`mission`]: keeps subscriptions in sync with the registry and forwards
//!   status reports into value stores

pub mod mission;
pub mod registry;
pub mod transport;

pub use mission::MissionControl;
pub use registry::{notifier, Change, Notifier, Registry};
pub use transport::{
    message_handler, topic_matches, InboundMessage, LoopbackTransport, MessageHandler,
    PublishedMessage, Transport,
};
#[cfg(feature = "mqtt")]
pub use transport::{MqttSettings, MqttTransport};
