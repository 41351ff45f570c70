//! Loop summarisation state.
//!
//! Loops buffer their body steps so that long traces stay navigable: on
//! `loop_end` the buffer collapses into a single summary step. The loop
//! stack is parallel to, but independent of, the frame stack, and the
//! nesting contract is strictly LIFO. A mismatched loop id never rewinds the
//! stack; the offending event is dropped so one malformed event cannot
//! corrupt nesting for the rest of the trace.

use crate::step::{FrameMetadata, ScopeKind, Step};

/// Buffering context for one active loop.
#[derive(Debug, Clone)]
pub struct LoopContext {
    /// The loop-instance tag.
    pub loop_id: String,
    /// Non-structural steps emitted while this loop is the innermost one.
    pub buffer: Vec<Step>,
    /// Frame metadata captured at `loop_start`. The summary uses this, not
    /// the metadata current at `loop_end`, so collapsed summaries display
    /// the frame under which the loop ran.
    pub frame: FrameMetadata,
    /// Scope classification at `loop_start`.
    pub scope: ScopeKind,
    /// The function the loop runs in.
    pub function: String,
    /// The source line of the loop statement.
    pub start_line: u32,
    /// The normalised source file of the loop statement.
    pub start_file: String,
    /// How many iterations have started.
    pub iteration_count: u32,
}

/// The loop stack and the iteration stack that shadows it.
#[derive(Debug, Default)]
pub struct LoopStack {
    stack: Vec<LoopContext>,
    iteration_stack: Vec<String>,
}

impl LoopStack {
    /// Creates an empty loop stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while at least one loop is buffering.
    pub fn is_active(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Pushes a new loop context.
    pub fn push(&mut self, ctx: LoopContext) {
        self.stack.push(ctx);
    }

    /// Pops the innermost loop context.
    pub fn pop(&mut self) -> Option<LoopContext> {
        self.stack.pop()
    }

    /// The innermost loop context, mutably.
    pub fn innermost_mut(&mut self) -> Option<&mut LoopContext> {
        self.stack.last_mut()
    }

    /// Returns `true` when the innermost loop carries the given id.
    pub fn top_matches(&self, loop_id: &str) -> bool {
        self.stack.last().is_some_and(|ctx| ctx.loop_id == loop_id)
    }

    /// Returns `true` when the innermost open iteration belongs to the
    /// given loop.
    pub fn iteration_top_matches(&self, loop_id: &str) -> bool {
        self.iteration_stack.last().is_some_and(|id| id == loop_id)
    }

    /// Starts an iteration of the innermost loop and returns its 1-based
    /// number. The caller must have checked `top_matches` first.
    pub fn begin_iteration(&mut self) -> Option<u32> {
        let ctx = self.stack.last_mut()?;
        ctx.iteration_count += 1;
        self.iteration_stack.push(ctx.loop_id.clone());
        Some(ctx.iteration_count)
    }

    /// Closes the innermost open iteration.
    pub fn end_iteration(&mut self) -> Option<String> {
        self.iteration_stack.pop()
    }

    /// The iteration count of the innermost loop.
    pub fn current_iteration(&self) -> Option<u32> {
        self.stack.last().map(|ctx| ctx.iteration_count)
    }

    /// Discards dangling iteration markers. Used by the orphan flush, where
    /// the loops owning them are being force-closed anyway.
    pub fn clear_iterations(&mut self) {
        self.iteration_stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(loop_id: &str) -> LoopContext {
        LoopContext {
            loop_id: loop_id.into(),
            buffer: Vec::new(),
            frame: FrameMetadata {
                frame_id: "main-0".into(),
                call_depth: 0,
                call_index: 0,
                parent_frame_id: None,
            },
            scope: ScopeKind::Function,
            function: "main".into(),
            start_line: 4,
            start_file: "main.cpp".into(),
            iteration_count: 0,
        }
    }

    #[test]
    fn test_lifo_matching() {
        let mut loops = LoopStack::new();
        loops.push(ctx("L1"));
        loops.push(ctx("L2"));

        assert!(loops.top_matches("L2"));
        assert!(!loops.top_matches("L1"));

        assert_eq!(loops.begin_iteration(), Some(1));
        assert!(loops.iteration_top_matches("L2"));
        assert!(!loops.iteration_top_matches("L1"));

        assert_eq!(loops.end_iteration().as_deref(), Some("L2"));
        assert!(!loops.iteration_top_matches("L2"));
    }

    #[test]
    fn test_iteration_numbers_increase() {
        let mut loops = LoopStack::new();
        loops.push(ctx("L1"));
        assert_eq!(loops.begin_iteration(), Some(1));
        loops.end_iteration();
        assert_eq!(loops.begin_iteration(), Some(2));
        loops.end_iteration();
        assert_eq!(loops.current_iteration(), Some(2));
    }
}
