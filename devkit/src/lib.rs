/*!
# Edge Agent DevKit - stubs and helpers for testing the agent

- In-memory MQTT client delivering to subscribed handlers
- In-memory local bus with NATS subject matching
- Canned EdgeX client
- SenML and bootstrap payload builders
- `TestHarness` running a full agent over the stubs
*/

pub mod bus_stub;
pub mod edgex_stub;
pub mod fixtures;
pub mod mqtt_stub;
pub mod test_utils;

pub use bus_stub::MockBus;
pub use edgex_stub::StubEdgex;
pub use fixtures::BootstrapReplyBuilder;
pub use mqtt_stub::MockMqttClient;
pub use test_utils::TestHarness;
