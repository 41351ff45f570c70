//! Call-frame and scope bookkeeping.
//!
//! Frames are reconstructed from `func_enter`/`func_exit` events. Each frame
//! owns a stack of scope records (the implicit function scope, lexical
//! blocks, loop iterations) and an independent pointer-alias table. The
//! alias table is deep-copied from the caller at push time, so a frame's
//! view of its pointer parameters never aliases caller state and teardown is
//! just dropping the frame.

use std::collections::BTreeSet;

use indexmap::IndexMap;

use stepscope_common::MemoryRegion;

use crate::step::{FrameMetadata, ScopeRecordKind};

/// One entry of a frame's scope stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeRecord {
    /// What kind of scope this is.
    pub kind: ScopeRecordKind,
    /// The owning loop, for loop-iteration scopes.
    pub loop_id: Option<String>,
    /// The 1-based iteration number, for loop-iteration scopes.
    pub iteration: Option<u32>,
    /// The declared lexical depth, for block scopes.
    pub depth: Option<u32>,
    /// Names owned by this scope, destroyed when it exits. Kept sorted so
    /// `destroyedSymbols` output is deterministic.
    pub variables: BTreeSet<String>,
}

impl ScopeRecord {
    /// The implicit scope of a whole function body.
    pub fn function() -> Self {
        ScopeRecord {
            kind: ScopeRecordKind::Function,
            loop_id: None,
            iteration: None,
            depth: None,
            variables: BTreeSet::new(),
        }
    }

    /// A lexical block at the given depth.
    pub fn block(depth: Option<u32>) -> Self {
        ScopeRecord {
            kind: ScopeRecordKind::Block,
            loop_id: None,
            iteration: None,
            depth,
            variables: BTreeSet::new(),
        }
    }

    /// One iteration of the given loop.
    pub fn loop_iteration(loop_id: String, iteration: u32) -> Self {
        ScopeRecord {
            kind: ScopeRecordKind::LoopIteration,
            loop_id: Some(loop_id),
            iteration: Some(iteration),
            depth: None,
            variables: BTreeSet::new(),
        }
    }
}

/// A pointer alias recorded in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PointerAlias {
    /// The name of the aliased object.
    pub alias_of: String,
    /// The aliased address, when the runtime captured one.
    pub aliased_address: Option<u64>,
    /// Whether the aliased storage lives on the heap.
    pub is_heap: bool,
}

/// One live function activation.
#[derive(Debug, Clone)]
pub struct Frame {
    /// `"{function}-{ordinal}"`, unique per function name within a run.
    pub frame_id: String,
    /// The normalised function name.
    pub function_name: String,
    /// 0 for `main`, caller's depth plus one otherwise.
    pub call_depth: u32,
    /// The caller's frame id, absent for `main`.
    pub parent_frame_id: Option<String>,
    /// The global call index at entry.
    pub entry_call_index: u64,
    /// Loops currently running in this frame: loop id → iteration count.
    pub active_loops: IndexMap<String, u32>,
    /// Pointer aliases visible in this frame.
    pub pointer_aliases: IndexMap<String, PointerAlias>,
    /// The scope stack, innermost last. Starts with the function scope.
    pub scope_stack: Vec<ScopeRecord>,
}

impl Frame {
    /// Creates a frame, inheriting a copy of the caller's pointer aliases.
    pub fn new(
        frame_id: String,
        function_name: String,
        entry_call_index: u64,
        parent: Option<&Frame>,
    ) -> Self {
        Frame {
            frame_id,
            function_name,
            call_depth: parent.map_or(0, |p| p.call_depth + 1),
            parent_frame_id: parent.map(|p| p.frame_id.clone()),
            entry_call_index,
            active_loops: IndexMap::new(),
            pointer_aliases: parent.map(|p| p.pointer_aliases.clone()).unwrap_or_default(),
            scope_stack: vec![ScopeRecord::function()],
        }
    }

    /// The frame metadata attached to steps emitted under this frame.
    pub fn metadata(&self) -> FrameMetadata {
        FrameMetadata {
            frame_id: self.frame_id.clone(),
            call_depth: self.call_depth,
            call_index: self.entry_call_index,
            parent_frame_id: self.parent_frame_id.clone(),
        }
    }

    /// Registers a name in the innermost scope record.
    pub fn declare(&mut self, name: &str) {
        if let Some(scope) = self.scope_stack.last_mut() {
            scope.variables.insert(name.to_owned());
        }
    }

    /// Drains the scope stack, aggregating every owned variable into one
    /// sorted set. Used at frame retirement.
    pub fn drain_scope_variables(&mut self) -> BTreeSet<String> {
        let mut destroyed = BTreeSet::new();
        for scope in self.scope_stack.drain(..) {
            destroyed.extend(scope.variables);
        }
        destroyed
    }
}

/// The resolved destination of a pointer dereference.
#[derive(Debug, Clone, PartialEq)]
pub struct PointerTarget {
    /// The name of the destination object, when its address maps to one.
    pub name: Option<String>,
    /// The destination address.
    pub address: Option<u64>,
    /// Whether the destination lives on the heap.
    pub is_heap: bool,
    /// The region classification of the destination.
    pub region: MemoryRegion,
}

/// The live frame stack plus the process-wide address registries.
///
/// The registries are never pruned: deferred pointer resolution may consult
/// an address long after the scope that registered it has exited.
#[derive(Debug, Default)]
pub struct FrameStack {
    frames: Vec<Frame>,
    address_names: IndexMap<u64, String>,
    address_frames: IndexMap<u64, String>,
}

impl FrameStack {
    /// Creates an empty frame stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a frame.
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Pops the innermost frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// The innermost frame.
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// The innermost frame, mutably.
    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// The number of live frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns `true` when no frame is live.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Removes the `main` frame wherever it sits in the stack. Used by the
    /// end-of-stream closure, which synthesises an exit for `main` only.
    pub fn take_main(&mut self) -> Option<Frame> {
        let idx = self.frames.iter().position(|f| f.function_name == "main")?;
        Some(self.frames.remove(idx))
    }

    /// Records that `addr` holds the object called `name`, owned by the
    /// given frame.
    pub fn register_address(&mut self, addr: u64, name: &str, frame_id: &str) {
        self.address_names.insert(addr, name.to_owned());
        self.address_frames.insert(addr, frame_id.to_owned());
    }

    /// The name registered at `addr`, if any.
    pub fn name_at(&self, addr: u64) -> Option<&str> {
        self.address_names.get(&addr).map(String::as_str)
    }

    /// Returns `true` if `name` has an alias record in any live frame.
    fn is_pointer(&self, name: &str) -> bool {
        self.frames
            .iter()
            .rev()
            .any(|f| f.pointer_aliases.contains_key(name))
    }

    /// Resolves a pointer by value: walks frames innermost-first for an
    /// alias record, follows the aliased address into the name registry, and
    /// keeps going while the target is itself a pointer. A visited set
    /// breaks alias cycles deterministically by giving up on them.
    pub fn resolve_pointer(&self, pointer_name: &str) -> Option<PointerTarget> {
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut current = pointer_name.to_owned();

        loop {
            if !visited.insert(current.clone()) {
                return None;
            }

            let alias = self
                .frames
                .iter()
                .rev()
                .find_map(|f| f.pointer_aliases.get(&current))?;

            let address = alias.aliased_address;
            let target = address.and_then(|addr| self.name_at(addr)).map(str::to_owned);

            match target {
                Some(name) if self.is_pointer(&name) => {
                    current = name;
                }
                _ => {
                    let region = if alias.is_heap {
                        MemoryRegion::Heap
                    } else if address.is_some() {
                        MemoryRegion::Stack
                    } else {
                        MemoryRegion::Unknown
                    };
                    return Some(PointerTarget {
                        name: target,
                        address,
                        is_heap: alias.is_heap,
                        region,
                    });
                }
            }
        }
    }
}
