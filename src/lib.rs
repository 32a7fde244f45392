pub mod broker;
pub mod codec;
pub mod gateway;
pub mod metrics;
pub mod sink;
pub mod util;

#[cfg(test)]
pub mod test_util;
