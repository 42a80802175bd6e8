pub mod config;
pub mod consumer_config;
pub mod kafka_producer;
