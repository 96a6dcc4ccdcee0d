//! totem-dynamic: unified entry point for the workspace.
//! Re-exports the internal crates so consumers can
//! `use totem_dynamic::pipeline::...`, `totem_dynamic::queue::...`, etc.

pub mod analyzer {
    pub use ::analyzer::*;
}
pub mod common {
    pub use ::common::*;
}
pub mod errors {
    pub use ::errors::*;
}
pub mod pipeline {
    pub use ::pipeline::*;
}
pub mod queue {
    pub use ::queue::*;
}
pub mod utils {
    pub use ::utils::*;
}
