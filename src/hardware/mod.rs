pub mod factory;

#[cfg(feature = "network")]
pub mod envoy;
#[cfg(feature = "network")]
pub mod mqtt;
#[cfg(feature = "network")]
pub mod wifi_dimmer;

pub use factory::DeviceFactory;

#[cfg(feature = "network")]
pub use envoy::EnvoyMeter;
#[cfg(feature = "network")]
pub use mqtt::MqttBroker;
#[cfg(feature = "network")]
pub use wifi_dimmer::WifiDimmer;
