//! Task dependency graph for gate sequencing.
//!
//! 1. **Builder** - validates ids and edges and rejects cycles up front
//! 2. **Resolver** - tracks task status and the ready set as tasks complete
//!
//! ## Example
//!
//! ```
//! use gauntlet::dag::{DagBuilder, TaskResolver, TaskSpec};
//!
//! let graph = DagBuilder::new(vec![
//!     TaskSpec::new("stress-test", vec![]),
//!     TaskSpec::new("structure", vec!["stress-test".to_string()]),
//! ])
//! .build()
//! .unwrap();
//!
//! let mut resolver = TaskResolver::new(graph);
//! assert_eq!(resolver.ready_tasks(), vec!["stress-test".to_string()]);
//! resolver.mark_complete("stress-test").unwrap();
//! assert_eq!(resolver.next_ready().as_deref(), Some("structure"));
//! ```

mod builder;
mod resolver;

pub use builder::{DagBuilder, TaskGraph, TaskIndex, TaskSpec};
pub use resolver::{Task, TaskResolver, TaskStatus};
