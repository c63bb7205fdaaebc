pub mod agent;
pub mod agent_memory;
pub mod project;
pub mod task;

#[cfg(test)]
pub(crate) mod test_utils;
