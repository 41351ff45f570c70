//! The raw event model written by the instrumented binary.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{ConvertError, ConvertErrorKind};

/// Traces shorter than this on a source with a `main` function usually mean
/// the instrumentation runtime never activated.
const MIN_EXPECTED_EVENTS: usize = 5;

/// The normalised tag of a raw event.
///
/// Tags are lowercased on parse. Unrecognised tags are preserved in
/// [`EventKind::Other`] so they can be carried through to the output instead
/// of silently disappearing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
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
    /// A `break` or `continue` executed.
    ControlFlow,
    /// A conditional expression was evaluated.
    ConditionEval,
    /// A branch was taken.
    BranchTaken,
    /// A variable declaration.
    Declare,
    /// A variable assignment.
    Assign,
    /// A function argument was bound to a parameter.
    ArgBind,
    /// An expression was evaluated for its value.
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
    /// Any tag this engine does not recognise, lowercased.
    Other(String),
}

impl EventKind {
    /// Parses a raw tag, normalising it to lowercase.
    pub fn parse(tag: &str) -> Self {
        let tag = tag.trim().to_lowercase();
        match tag.as_str() {
            "func_enter" => EventKind::FuncEnter,
            "func_exit" => EventKind::FuncExit,
            "return" => EventKind::Return,
            "block_enter" => EventKind::BlockEnter,
            "block_exit" => EventKind::BlockExit,
            "loop_start" => EventKind::LoopStart,
            "loop_body_start" => EventKind::LoopBodyStart,
            "loop_iteration_end" => EventKind::LoopIterationEnd,
            "loop_end" => EventKind::LoopEnd,
            "loop_condition" => EventKind::LoopCondition,
            "control_flow" => EventKind::ControlFlow,
            "condition_eval" => EventKind::ConditionEval,
            "branch_taken" => EventKind::BranchTaken,
            "declare" => EventKind::Declare,
            "assign" => EventKind::Assign,
            "arg_bind" => EventKind::ArgBind,
            "expression_eval" => EventKind::ExpressionEval,
            "array_create" => EventKind::ArrayCreate,
            "array_index_assign" => EventKind::ArrayIndexAssign,
            "pointer_alias" => EventKind::PointerAlias,
            "pointer_deref_write" => EventKind::PointerDerefWrite,
            "heap_alloc" => EventKind::HeapAlloc,
            "heap_free" => EventKind::HeapFree,
            "heap_write" => EventKind::HeapWrite,
            _ => EventKind::Other(tag),
        }
    }

    /// Returns the lowercase tag.
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::FuncEnter => "func_enter",
            EventKind::FuncExit => "func_exit",
            EventKind::Return => "return",
            EventKind::BlockEnter => "block_enter",
            EventKind::BlockExit => "block_exit",
            EventKind::LoopStart => "loop_start",
            EventKind::LoopBodyStart => "loop_body_start",
            EventKind::LoopIterationEnd => "loop_iteration_end",
            EventKind::LoopEnd => "loop_end",
            EventKind::LoopCondition => "loop_condition",
            EventKind::ControlFlow => "control_flow",
            EventKind::ConditionEval => "condition_eval",
            EventKind::BranchTaken => "branch_taken",
            EventKind::Declare => "declare",
            EventKind::Assign => "assign",
            EventKind::ArgBind => "arg_bind",
            EventKind::ExpressionEval => "expression_eval",
            EventKind::ArrayCreate => "array_create",
            EventKind::ArrayIndexAssign => "array_index_assign",
            EventKind::PointerAlias => "pointer_alias",
            EventKind::PointerDerefWrite => "pointer_deref_write",
            EventKind::HeapAlloc => "heap_alloc",
            EventKind::HeapFree => "heap_free",
            EventKind::HeapWrite => "heap_write",
            EventKind::Other(tag) => tag,
        }
    }

    /// Returns `true` for events whose absence would break the reconstructed
    /// nesting. These are kept through filtering even when no source
    /// location can be resolved for them.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            EventKind::FuncEnter
                | EventKind::FuncExit
                | EventKind::Return
                | EventKind::BlockEnter
                | EventKind::BlockExit
                | EventKind::LoopStart
                | EventKind::LoopBodyStart
                | EventKind::LoopIterationEnd
                | EventKind::LoopEnd
                | EventKind::LoopCondition
                | EventKind::ControlFlow
                | EventKind::ConditionEval
                | EventKind::BranchTaken
                | EventKind::HeapAlloc
                | EventKind::HeapFree
        )
    }
}

impl From<String> for EventKind {
    fn from(tag: String) -> Self {
        EventKind::parse(&tag)
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw event from the instrumented binary.
///
/// All payload fields are optional; which ones are present depends on the
/// event kind. Fields this engine does not know about are collected in
/// `extra` so unknown event kinds can be passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    /// The event tag.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// The instruction pointer, if the runtime captured one.
    #[serde(default, deserialize_with = "deserialize_addr", skip_serializing_if = "Option::is_none")]
    pub addr: Option<u64>,
    /// Pre-resolved file path, if the runtime embedded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Pre-resolved source line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Function name as the runtime saw it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub func: Option<String>,
    /// Variable or expression name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The observed value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Loop-instance tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<String>,
    /// Condition-instance tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_id: Option<String>,
    /// The pointer variable involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer_name: Option<String>,
    /// The name of the object a pointer now aliases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias_of: Option<String>,
    /// The address a pointer now aliases.
    #[serde(default, deserialize_with = "deserialize_addr", skip_serializing_if = "Option::is_none")]
    pub aliased_address: Option<u64>,
    /// Whether the aliased or written memory lives on the heap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_heap: Option<bool>,
    /// Array dimensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Vec<u32>>,
    /// Array element indices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indices: Option<Vec<u32>>,
    /// Allocation size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Lexical block depth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_depth: Option<u32>,
    /// Any fields this engine does not model.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RawEvent {
    /// Creates an event of the given kind with an empty payload.
    pub fn new(kind: EventKind) -> Self {
        RawEvent {
            kind,
            addr: None,
            file: None,
            line: None,
            func: None,
            name: None,
            value: None,
            loop_id: None,
            condition_id: None,
            pointer_name: None,
            alias_of: None,
            aliased_address: None,
            is_heap: None,
            dimensions: None,
            indices: None,
            size: None,
            block_depth: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Instrumentation runtimes emit addresses both as JSON integers and as
/// `"0x…"` strings; accept either.
fn deserialize_addr<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Addr {
        Num(u64),
        Text(String),
    }

    Ok(match Option::<Addr>::deserialize(deserializer)? {
        None => None,
        Some(Addr::Num(n)) => Some(n),
        Some(Addr::Text(s)) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
    })
}

/// A parsed raw event file, of shape
/// `{"events": […], "tracked_functions": […]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrace {
    /// The ordered event stream.
    pub events: Vec<RawEvent>,
    /// Function names the instrumentation pass decided to track.
    #[serde(default)]
    pub tracked_functions: Vec<String>,
}

impl RawTrace {
    /// Parses the JSON event file written by the instrumented binary.
    ///
    /// An empty event stream is a hard error: it means the instrumentation
    /// runtime never ran.
    pub fn parse(buf: &[u8]) -> Result<Self, ConvertError> {
        let trace: RawTrace = serde_json::from_slice(buf)
            .map_err(|e| ConvertError::new(ConvertErrorKind::BadTraceFile, e))?;
        if trace.events.is_empty() {
            return Err(ConvertErrorKind::InstrumentationInactive.into());
        }
        Ok(trace)
    }

    /// Warns when the event count looks too low for the program that ran.
    pub fn validate(&self, source_text: &str) {
        if self.events.len() < MIN_EXPECTED_EVENTS && source_text.contains("int main") {
            tracing::warn!(
                events = self.events.len(),
                "very few events captured, instrumentation may be inactive"
            );
        }
    }
}

/// The kind of input operation detected on a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// A C `scanf` family call.
    Scanf,
    /// A C++ `std::cin` extraction.
    Cin,
}

/// A detected input operation on one source line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputOp {
    /// How the program reads input on this line.
    #[serde(rename = "type")]
    pub kind: InputKind,
    /// The variables the input is read into.
    pub variables: Vec<String>,
    /// The `scanf` format string, if applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// A prompt to show the learner.
    pub prompt: String,
}

/// Source line → detected input operation. Entries are removed as they fire,
/// so each line requests input at most once.
pub type InputMap = IndexMap<u32, InputOp>;
