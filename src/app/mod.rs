// Ports the pipeline core talks through; adapters live in `infra`
pub mod ports;
