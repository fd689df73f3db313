//! Shared domain types for the Dockyard lifecycle engine.
//!
//! | Module      | Contents                                                        |
//! |-------------|-----------------------------------------------------------------|
//! | `container` | `ContainerRecord`, `ContainerStatus`, resource limits, metrics  |
//! | `task`      | `Task`, `TaskStatus`, `TaskType`, `TaskUpdate`                  |
//! | `event`     | Event Bus payloads and subscription `Topic`s                    |
//! | `error`     | `DockyardError` and its `ErrorKind` classification              |

pub mod container;
pub mod error;
pub mod event;
pub mod task;

pub use container::*;
pub use error::{DockyardError, ErrorKind};
pub use event::*;
pub use task::*;
