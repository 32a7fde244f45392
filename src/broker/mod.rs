pub mod device_broker;
pub mod supervisor;
