pub mod graph;
pub mod resolver;
pub mod scheduler;
pub mod triggers;

pub use graph::{DependencyGraph, ViewNode};
pub use resolver::{Resolved, Resolver};
pub use scheduler::{initial_refresh_order, RefreshPlan};
pub use triggers::{install_statements, teardown_statements, RefreshObjects};
