//! Built-in block kinds.

mod file;
mod local;
mod state;

use crate::application::block::BlockRegistry;

pub use file::{FileBlock, FileFactory};
pub use local::{LocalBlock, LocalFactory};
pub use state::{StateBlock, StateFactory};

/// Registry with every block kind shipped with the engine.
pub fn builtin_registry() -> BlockRegistry {
    let mut registry = BlockRegistry::new();
    registry.register("file", FileFactory);
    registry.register("local", LocalFactory);
    registry.register("state", StateFactory);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_kinds_are_registered() {
        let registry = builtin_registry();
        assert_eq!(registry.names(), ["file", "local", "state"]);
        assert!(registry.get("http").is_none());
    }
}
