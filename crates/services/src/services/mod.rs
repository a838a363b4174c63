pub mod cache;
pub mod channels;
pub mod commands;
pub mod events;
pub mod killswitch;
pub mod locks;
pub mod modes;
pub mod plans;
pub mod publisher;
pub mod queue;
pub mod scheduler;
pub mod stability;

#[cfg(test)]
pub(crate) mod test_support;
