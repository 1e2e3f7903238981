//! The immutable output of `endRoot`.
//!
//! A [`RootProgram`] is what the three dispatch tiers in `opforge-vm`
//! actually execute; nothing in this crate ever mutates one once built,
//! quickening included — that rewrites words in `bc` through interior
//! mutability on the VM side, not through this type.

use crate::buffer::{ExceptionHandlerEntry, SourceInfoEntry};
use crate::constant_pool::Constant;

/// A frozen, executable program: one per guest function/closure shape.
#[derive(Debug, Clone)]
pub struct RootProgram {
    pub bc: Vec<u16>,
    pub constants: Vec<Constant>,
    /// Sorted innermost-first (narrowest `[start_bci, end_bci)` range first)
    /// so linear-scan dispatch finds the nearest enclosing handler without
    /// needing a smarter data structure (DESIGN.md Open Question).
    pub handlers: Vec<ExceptionHandlerEntry>,
    pub num_locals: u32,
    /// Size to allocate for the lazily-built per-root cached-data (`Node`)
    /// array that the cached/instrumented tiers index into.
    pub num_nodes: u32,
    /// Size to allocate for the lazily-built branch-profile array.
    pub num_profiles: u32,
    pub max_stack_height: i32,
    pub source_info: Vec<SourceInfoEntry>,
}

impl RootProgram {
    /// Find the innermost handler covering `bci`, if any. Handlers are
    /// sorted narrowest-first, so the first match is correct.
    pub fn find_handler(&self, bci: u32) -> Option<&ExceptionHandlerEntry> {
        self.handlers
            .iter()
            .find(|h| h.start_bci <= bci && bci < h.end_bci)
    }

    pub fn source_info_at(&self, bci: u32) -> Option<&SourceInfoEntry> {
        self.source_info.iter().find(|entry| entry.bci == bci)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(start: u32, end: u32, handler_bci: u32) -> ExceptionHandlerEntry {
        ExceptionHandlerEntry {
            start_bci: start,
            end_bci: end,
            handler_bci,
            start_sp: 0,
            exc_local_idx: 0,
        }
    }

    #[test]
    fn find_handler_picks_narrowest_enclosing() {
        let program = RootProgram {
            bc: vec![],
            constants: vec![],
            handlers: vec![handler(0, 10, 100), handler(2, 6, 200)],
            num_locals: 0,
            num_nodes: 0,
            num_profiles: 0,
            max_stack_height: 0,
            source_info: vec![],
        };
        assert_eq!(program.find_handler(3).unwrap().handler_bci, 200);
        assert_eq!(program.find_handler(7).unwrap().handler_bci, 100);
        assert!(program.find_handler(20).is_none());
    }
}
