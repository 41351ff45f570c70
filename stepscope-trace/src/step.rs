//! The emitted step model consumed by the visualisation layers.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use stepscope_common::MemoryRegion;

use crate::event::InputOp;

/// The tag of an emitted step.
///
/// A superset of the raw event tags: the engine synthesises
/// `program_start`/`program_end`, variable steps, scope exits, loop
/// summaries, output and input-request steps. Unknown raw tags are carried
/// through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum StepKind {
    /// Synthetic first step of every run.
    ProgramStart,
    /// Synthetic last step of every run.
    ProgramEnd,
    /// A function activation began.
    FuncEnter,
    /// A function activation ended.
    FuncExit,
    /// A `return` statement executed.
    Return,
    /// A block scope opened.
    BlockEnter,
    /// A block scope closed.
    BlockExit,
    /// A scope ended and its variables were destroyed.
    ScopeExit,
    /// A variable came into scope.
    VarDeclare,
    /// A variable changed its value.
    VarAssign,
    /// An argument was bound to a parameter.
    ArgBind,
    /// An expression was evaluated.
    ExpressionEval,
    /// A stack array came into existence.
    ArrayCreate,
    /// An array element was assigned.
    ArrayIndexAssign,
    /// A pointer was made to alias another object.
    PointerAlias,
    /// A write through a dereferenced pointer.
    PointerDerefWrite,
    /// A heap allocation.
    HeapAlloc,
    /// A heap deallocation.
    HeapFree,
    /// A write into heap memory.
    HeapWrite,
    /// A loop statement was reached.
    LoopStart,
    /// One loop iteration began.
    LoopBodyStart,
    /// One loop iteration finished.
    LoopIterationEnd,
    /// A loop statement completed.
    LoopEnd,
    /// A loop condition was evaluated.
    LoopCondition,
    /// The collapsed body of a completed loop.
    LoopBodySummary,
    /// A conditional expression was evaluated.
    ConditionEval,
    /// A branch was taken.
    BranchTaken,
    /// A `break` or `continue` executed.
    ControlFlow,
    /// The program is waiting for user input.
    InputRequest,
    /// The program printed to stdout.
    Output,
    /// A raw event tag this engine does not recognise.
    Other(String),
}

impl StepKind {
    /// Returns the lowercase tag.
    pub fn as_str(&self) -> &str {
        match self {
            StepKind::ProgramStart => "program_start",
            StepKind::ProgramEnd => "program_end",
            StepKind::FuncEnter => "func_enter",
            StepKind::FuncExit => "func_exit",
            StepKind::Return => "return",
            StepKind::BlockEnter => "block_enter",
            StepKind::BlockExit => "block_exit",
            StepKind::ScopeExit => "scope_exit",
            StepKind::VarDeclare => "var_declare",
            StepKind::VarAssign => "var_assign",
            StepKind::ArgBind => "arg_bind",
            StepKind::ExpressionEval => "expression_eval",
            StepKind::ArrayCreate => "array_create",
            StepKind::ArrayIndexAssign => "array_index_assign",
            StepKind::PointerAlias => "pointer_alias",
            StepKind::PointerDerefWrite => "pointer_deref_write",
            StepKind::HeapAlloc => "heap_alloc",
            StepKind::HeapFree => "heap_free",
            StepKind::HeapWrite => "heap_write",
            StepKind::LoopStart => "loop_start",
            StepKind::LoopBodyStart => "loop_body_start",
            StepKind::LoopIterationEnd => "loop_iteration_end",
            StepKind::LoopEnd => "loop_end",
            StepKind::LoopCondition => "loop_condition",
            StepKind::LoopBodySummary => "loop_body_summary",
            StepKind::ConditionEval => "condition_eval",
            StepKind::BranchTaken => "branch_taken",
            StepKind::ControlFlow => "control_flow",
            StepKind::InputRequest => "input_request",
            StepKind::Output => "output",
            StepKind::Other(tag) => tag,
        }
    }

    /// Returns `true` for steps that must stay in the global sequence even
    /// while a loop is buffering. Everything else is collapsed into the
    /// innermost active loop's body summary.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            StepKind::FuncEnter
                | StepKind::FuncExit
                | StepKind::Return
                | StepKind::BlockEnter
                | StepKind::BlockExit
                | StepKind::LoopStart
                | StepKind::LoopBodyStart
                | StepKind::LoopIterationEnd
                | StepKind::LoopEnd
                | StepKind::LoopCondition
                | StepKind::ConditionEval
                | StepKind::BranchTaken
                | StepKind::ControlFlow
                | StepKind::HeapAlloc
                | StepKind::HeapFree
        )
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope classification carried on every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// Outside any function activation.
    Global,
    /// Directly inside a function body.
    Function,
    /// Inside a lexical block or a loop iteration.
    Block,
}

/// The kind of scope record being destroyed by a `scope_exit` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeRecordKind {
    /// The implicit scope of a whole function body.
    Function,
    /// A lexical `{ … }` block.
    Block,
    /// One iteration of a loop body.
    LoopIteration,
}

/// Frame metadata attached to every step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMetadata {
    /// `"{function}-{ordinal}"`, unique per function name within a run.
    pub frame_id: String,
    /// 0 for `main`, the caller's depth plus one otherwise.
    pub call_depth: u32,
    /// The global call index at frame entry.
    pub call_index: u64,
    /// The caller's frame id, absent for `main`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_frame_id: Option<String>,
}

/// Where a pointer points after an alias or dereference step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsTo {
    /// The memory region of the destination.
    pub region: MemoryRegion,
    /// The name of the destination object, when the address maps to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// The destination address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
}

/// One escape sequence detected in an output chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscapeInfo {
    /// The source-level escape, e.g. `\n`.
    pub escape: String,
    /// A human-readable name, e.g. `newline`.
    pub meaning: String,
    /// The character the escape renders to.
    pub rendered: String,
}

/// The kind-specific payload of a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StepPayload {
    /// No extra fields.
    Empty {},
    /// A bare observed value (`return`, `control_flow`).
    #[serde(rename_all = "camelCase")]
    Value {
        /// The observed value.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    /// A condition evaluation (`condition_eval`, `branch_taken`).
    #[serde(rename_all = "camelCase")]
    Condition {
        /// The condition-instance tag.
        #[serde(skip_serializing_if = "Option::is_none")]
        condition_id: Option<String>,
        /// The value the condition evaluated to.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    /// A named variable step (`var_declare`, `var_assign`, `arg_bind`,
    /// `expression_eval`).
    #[serde(rename_all = "camelCase")]
    Var {
        /// The variable or expression text.
        symbol: String,
        /// Its observed value.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        /// The memory region, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        memory_region: Option<MemoryRegion>,
    },
    /// An array step (`array_create`, `array_index_assign`).
    #[serde(rename_all = "camelCase")]
    Array {
        /// The array name.
        symbol: String,
        /// Declared dimensions, on creation.
        #[serde(skip_serializing_if = "Option::is_none")]
        dimensions: Option<Vec<u32>>,
        /// Element indices, on assignment. Carried through opaquely.
        #[serde(skip_serializing_if = "Option::is_none")]
        indices: Option<Vec<u32>>,
        /// The assigned value.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        /// The memory region of the array storage.
        memory_region: MemoryRegion,
    },
    /// A pointer alias step.
    #[serde(rename_all = "camelCase")]
    Pointer {
        /// The pointer name.
        symbol: String,
        /// Where it points now.
        points_to: PointsTo,
    },
    /// A write through a dereferenced pointer.
    #[serde(rename_all = "camelCase")]
    DerefWrite {
        /// The pointer name.
        symbol: String,
        /// The written value.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        /// The resolved destination of the write.
        points_to: PointsTo,
    },
    /// A heap step (`heap_alloc`, `heap_free`, `heap_write`).
    #[serde(rename_all = "camelCase")]
    Heap {
        /// The variable owning the allocation, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        /// The heap address.
        #[serde(skip_serializing_if = "Option::is_none")]
        address: Option<u64>,
        /// The allocation size in bytes.
        #[serde(skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        /// The written value, for `heap_write`.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        /// Always [`MemoryRegion::Heap`].
        memory_region: MemoryRegion,
    },
    /// A scope ended; the listed symbols were destroyed.
    #[serde(rename_all = "camelCase")]
    ScopeExit {
        /// What kind of scope ended.
        scope_type: ScopeRecordKind,
        /// The destroyed variable names, sorted.
        destroyed_symbols: Vec<String>,
    },
    /// A loop boundary step (`loop_start`, `loop_body_start`,
    /// `loop_iteration_end`, `loop_end`).
    #[serde(rename_all = "camelCase")]
    Loop {
        /// The loop-instance tag.
        loop_id: String,
        /// The 1-based iteration number, where applicable.
        #[serde(skip_serializing_if = "Option::is_none")]
        iteration: Option<u32>,
    },
    /// A loop condition evaluation.
    #[serde(rename_all = "camelCase")]
    LoopCondition {
        /// The loop-instance tag.
        #[serde(skip_serializing_if = "Option::is_none")]
        loop_id: Option<String>,
        /// The condition-instance tag.
        #[serde(skip_serializing_if = "Option::is_none")]
        condition_id: Option<String>,
        /// The value the condition evaluated to.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    /// The collapsed body of a completed loop.
    #[serde(rename_all = "camelCase")]
    LoopSummary {
        /// The loop-instance tag.
        loop_id: String,
        /// How many iterations ran.
        iterations: u32,
        /// The buffered body steps, in raw event order, each carrying an
        /// `internalStepIndex` instead of a `stepIndex`.
        events: Vec<Step>,
    },
    /// The program printed to stdout.
    #[serde(rename_all = "camelCase")]
    Output {
        /// The display form of the chunk.
        text: String,
        /// The chunk verbatim.
        raw_text: String,
        /// Escapes detected in the chunk.
        escape_info: Vec<EscapeInfo>,
        /// The chunk's position in the captured stream, when chunked.
        #[serde(skip_serializing_if = "Option::is_none")]
        chunk_index: Option<usize>,
    },
    /// The program is waiting for input.
    #[serde(rename_all = "camelCase")]
    Input {
        /// How the program reads input on this line.
        #[serde(rename = "type")]
        kind: crate::event::InputKind,
        /// The variables the input is read into.
        variables: Vec<String>,
        /// The `scanf` format string, if applicable.
        #[serde(skip_serializing_if = "Option::is_none")]
        format: Option<String>,
        /// A prompt to show the learner.
        prompt: String,
        /// Downstream players stop advancing on this step.
        pause_execution: bool,
    },
    /// The payload of an unrecognised raw event, verbatim.
    Raw(serde_json::Map<String, Value>),
}

impl StepPayload {
    /// Builds the input-request payload from a detected input operation.
    pub fn input(op: InputOp) -> Self {
        StepPayload::Input {
            kind: op.kind,
            variables: op.variables,
            format: op.format,
            prompt: op.prompt,
            pause_execution: true,
        }
    }
}

/// One emitted step.
///
/// Steps serialise to camelCase JSON for the visualisation layers. The
/// kind-specific payload is flattened into the same object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// The final position in the sequence; equals the array index after the
    /// renumber sweep. Absent on steps buffered inside a loop summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    /// The original emission index of a step buffered inside a loop summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_step_index: Option<usize>,
    /// The step tag.
    pub event_type: StepKind,
    /// The 1-based source line, 0 for synthetic steps.
    pub line: u32,
    /// The function the step executed in.
    pub function: String,
    /// Scope classification.
    pub scope: ScopeKind,
    /// Normalised source file basename.
    pub file: String,
    /// Strictly increasing across the global sequence.
    pub timestamp: u64,
    /// A beginner-readable description of what happened.
    pub explanation: String,
    /// Reserved for future use; always empty.
    pub internal_events: Vec<Value>,
    /// Frame metadata of the activation the step belongs to.
    #[serde(flatten)]
    pub frame: FrameMetadata,
    /// Kind-specific fields.
    #[serde(flatten)]
    pub payload: StepPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> FrameMetadata {
        FrameMetadata {
            frame_id: "main-0".into(),
            call_depth: 0,
            call_index: 0,
            parent_frame_id: None,
        }
    }

    #[test]
    fn test_step_serialises_camel_case() {
        let step = Step {
            step_index: Some(3),
            internal_step_index: None,
            event_type: StepKind::VarAssign,
            line: 7,
            function: "main".into(),
            scope: ScopeKind::Function,
            file: "main.cpp".into(),
            timestamp: 4,
            explanation: "Assigned 9 to `x`".into(),
            internal_events: Vec::new(),
            frame: frame(),
            payload: StepPayload::Var {
                symbol: "x".into(),
                value: Some(Value::from(9)),
                memory_region: None,
            },
        };

        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["stepIndex"], 3);
        assert_eq!(json["eventType"], "var_assign");
        assert_eq!(json["frameId"], "main-0");
        assert_eq!(json["callDepth"], 0);
        assert_eq!(json["symbol"], "x");
        assert_eq!(json["value"], 9);
        assert_eq!(json["internalEvents"], serde_json::json!([]));
        assert!(json.get("parentFrameId").is_none());
        assert!(json.get("internalStepIndex").is_none());
    }

    #[test]
    fn test_scope_exit_payload() {
        let payload = StepPayload::ScopeExit {
            scope_type: ScopeRecordKind::LoopIteration,
            destroyed_symbols: vec!["i".into(), "tmp".into()],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["scopeType"], "loop_iteration");
        assert_eq!(json["destroyedSymbols"], serde_json::json!(["i", "tmp"]));
    }

    #[test]
    fn test_unknown_kind_serialises_verbatim() {
        let kind = StepKind::Other("vtable_patch".into());
        assert_eq!(serde_json::to_value(&kind).unwrap(), "vtable_patch");
    }
}
