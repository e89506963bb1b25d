//! Concurrent lifetime manager for externally owned handles.
//!
//! `tether` tracks opaque handles acquired from a foreign library,
//! reference-counts them, and owns the decision of *when* to run each
//! handle's caller-supplied destructor. A handle may declare dependencies on
//! other handles: depending on a handle pins it, and destroying a handle
//! releases its dependencies in turn, so teardown respects the dependency
//! graph without any global ordering between unrelated handles.
//!
//! Destruction is asynchronous. [`HandleRegistry::unregister`] posts a
//! release onto a single-consumer agent thread and returns immediately;
//! the agent serializes every destructor invocation and survives individual
//! failures, which are delivered to a caller-installed error sink.
//!
//! - [`HandleRegistry`]: the concurrent registry and its protocol.
//! - [`HandleKey`]: `(class, id)` identity of a tracked handle.
//! - [`Destructor`]: the caller-supplied teardown callback.
//! - [`RegistryError`]: the closed set of failures.
//!
//! # Example
//!
//! ```rust
//! use tether::{Destructor, HandleKey, HandleRegistry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = HandleRegistry::new();
//!
//! // A parent handle pinning a child it depends on.
//! let child = HandleKey::new("buffer", 40u64);
//! let parent = HandleKey::new("texture", 41u64);
//!
//! let close_child: Destructor<u64> = Box::new(|id| {
//!     println!("releasing buffer {id}");
//!     Ok(())
//! });
//! let close_parent: Destructor<u64> = Box::new(|id| {
//!     println!("releasing texture {id}");
//!     Ok(())
//! });
//!
//! registry.register(child.clone(), Some(close_child), None)?;
//! registry.register(parent.clone(), Some(close_parent), Some(&[child.clone()]))?;
//!
//! // Give up our references; the parent's teardown releases the child.
//! registry.unregister(child);
//! registry.unregister(parent);
//! registry.flush();
//! assert!(registry.is_empty());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod agent;
mod context;
mod deps;

pub mod error;
pub mod key;
pub mod registry;

pub use context::{Destructor, DestructorError};
pub use error::RegistryError;
pub use key::{HandleKey, KeyPart};
pub use registry::{ErrorSink, HandleRegistry};
