pub mod context;
pub mod engine;

pub use context::{BrokerContext, Registry};
pub use engine::{Broker, PublishReceipt};

#[cfg(test)]
mod tests;
