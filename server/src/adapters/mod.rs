pub mod camera;
pub mod mqtt_discovery;
pub mod webhooks;
