//! Git-backed coordination for cub: a sync branch for shared state, managed
//! sections of the agent document, and hierarchical id allocation.

pub mod collision;
pub mod config;
pub mod context;
pub mod counters;
pub mod git;
pub mod hooks;
pub mod ids;
pub mod managed;
pub mod project;
pub mod sequence;
pub mod sync;
pub mod sync_state;
pub mod tasks;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}


#[cfg(test)]
mod tests {
    use super::version;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
