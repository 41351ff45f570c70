//! The trace converter: raw events in, semantic steps out.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use serde_json::Value;

use stepscope_common::{normalize_function, MemoryRegion, Resolution, Resolve};

use crate::event::{EventKind, InputMap, InputOp, RawEvent, RawTrace};
use crate::filter::{Classifier, EventLocation, FilterDecision};
use crate::frame::{Frame, FrameStack, PointerAlias, ScopeRecord};
use crate::loops::{LoopContext, LoopStack};
use crate::output::{render_chunk, CapturedStdout};
use crate::step::{
    FrameMetadata, PointsTo, ScopeKind, ScopeRecordKind, Step, StepKind, StepPayload,
};
use crate::{ConvertError, ConvertErrorKind};

/// The result of one conversion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversion {
    /// The renumbered step sequence.
    pub steps: Vec<Step>,
    /// Every function observed in a `func_enter` event, plus `main`.
    pub tracked_functions: BTreeSet<String>,
}

/// Converts the raw event stream of one instrumented run into steps.
///
/// A converter owns all mutable conversion state: the frame stack, the loop
/// and iteration stacks, the address registries and the step counters. It is
/// consumed by [`convert`](TraceConverter::convert), is not reentrant and
/// not shareable across threads; callers that need parallelism create one
/// converter per trace.
#[derive(Debug)]
pub struct TraceConverter<R> {
    resolver: R,
    classifier: Classifier,
    source_file: String,
    input_lines: InputMap,
    cancel: Option<Arc<AtomicBool>>,

    steps: Vec<Step>,
    step_index: usize,
    last_timestamp: u64,
    global_call_index: u64,
    frame_counts: IndexMap<String, u32>,
    frames: FrameStack,
    loops: LoopStack,
    tracked: BTreeSet<String>,
    declared: IndexSet<String>,
    main_metadata: FrameMetadata,
    main_claimed: bool,
}

impl<R: Resolve> TraceConverter<R> {
    /// Creates a converter for the given user source file.
    pub fn new(resolver: R, source_file: &Path) -> Self {
        let classifier = Classifier::new(source_file);
        let source_file = classifier.source_basename().to_owned();
        TraceConverter {
            resolver,
            classifier,
            source_file,
            input_lines: InputMap::new(),
            cancel: None,
            steps: Vec::new(),
            step_index: 0,
            last_timestamp: 0,
            global_call_index: 0,
            frame_counts: IndexMap::new(),
            frames: FrameStack::new(),
            loops: LoopStack::new(),
            tracked: BTreeSet::new(),
            declared: IndexSet::new(),
            main_metadata: FrameMetadata {
                frame_id: "main-0".into(),
                call_depth: 0,
                call_index: 0,
                parent_frame_id: None,
            },
            main_claimed: false,
        }
    }

    /// Sets the detected input operations per source line. Each entry fires
    /// at most once, on the first event resolved to its line.
    pub fn set_input_lines(&mut self, input_lines: InputMap) {
        self.input_lines = input_lines;
    }

    /// Installs a cancellation flag checked between events. A cancelled
    /// conversion still returns a well-formed prefix.
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    /// Runs the conversion.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn convert(
        mut self,
        trace: &RawTrace,
        stdout: &CapturedStdout,
    ) -> Result<Conversion, ConvertError> {
        if trace.events.is_empty() {
            return Err(ConvertErrorKind::InstrumentationInactive.into());
        }

        self.tracked.insert("main".to_owned());
        self.tracked.extend(trace.tracked_functions.iter().cloned());

        self.open_program();

        for event in &trace.events {
            if self.is_cancelled() {
                tracing::warn!("conversion cancelled, finishing with a well-formed prefix");
                break;
            }
            self.process_event(event)?;
        }

        self.flush_orphan_loops();
        self.emit_output_steps(stdout);
        self.close_main();
        self.emit_program_end();
        self.renumber()?;

        Ok(Conversion {
            steps: self.steps,
            tracked_functions: self.tracked,
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    // Frame and emission plumbing below.

    fn next_ordinal(&mut self, function: &str) -> u32 {
        let counter = self.frame_counts.entry(function.to_owned()).or_insert(0);
        let ordinal = *counter;
        *counter += 1;
        ordinal
    }

    fn current_metadata(&self) -> FrameMetadata {
        self.frames
            .top()
            .map(Frame::metadata)
            .unwrap_or_else(|| self.main_metadata.clone())
    }

    fn current_function(&self) -> String {
        self.frames
            .top()
            .map(|f| f.function_name.clone())
            .unwrap_or_else(|| "main".to_owned())
    }

    fn current_scope(&self) -> ScopeKind {
        match self.frames.top() {
            None => ScopeKind::Global,
            Some(frame) => match frame.scope_stack.last() {
                Some(scope) if scope.kind != ScopeRecordKind::Function => ScopeKind::Block,
                _ => ScopeKind::Function,
            },
        }
    }

    /// The function name a step at this location should display.
    fn step_function(&self, location: &EventLocation) -> String {
        let function = normalize_function(&location.function);
        if function.is_empty() || function == "unknown" {
            self.current_function()
        } else {
            function
        }
    }

    /// The normalised file a step at this location should display. Never
    /// fabricated: an unresolved location yields an empty file.
    fn step_file(&self, location: &EventLocation) -> String {
        if location.is_missing() {
            String::new()
        } else {
            stepscope_common::normalize_file(&location.file)
        }
    }

    fn make_step(
        &self,
        kind: StepKind,
        location: &EventLocation,
        explanation: String,
        payload: StepPayload,
    ) -> Step {
        Step {
            step_index: None,
            internal_step_index: None,
            event_type: kind,
            line: location.line,
            function: self.step_function(location),
            scope: self.current_scope(),
            file: self.step_file(location),
            timestamp: 0,
            explanation,
            internal_events: Vec::new(),
            frame: self.current_metadata(),
            payload,
        }
    }

    fn synthetic_step(
        &self,
        kind: StepKind,
        scope: ScopeKind,
        explanation: String,
        payload: StepPayload,
    ) -> Step {
        Step {
            step_index: None,
            internal_step_index: None,
            event_type: kind,
            line: 0,
            function: self.current_function(),
            scope,
            file: self.source_file.clone(),
            timestamp: 0,
            explanation,
            internal_events: Vec::new(),
            frame: self.current_metadata(),
            payload,
        }
    }

    /// The emitter gate. Every step passes through here exactly once: the
    /// counters advance, then the step lands either in the global sequence
    /// or in the innermost active loop's buffer.
    fn push_step(&mut self, mut step: Step) {
        step.step_index = Some(self.step_index);
        self.step_index += 1;
        self.last_timestamp += 1;
        step.timestamp = self.last_timestamp;

        if !step.event_type.is_structural() {
            if let Some(ctx) = self.loops.innermost_mut() {
                ctx.buffer.push(step);
                return;
            }
        }
        self.steps.push(step);
    }

    // Event processing below.

    /// Combines the event's embedded location with the resolver's answer.
    fn locate(&mut self, event: &RawEvent) -> Result<EventLocation, ConvertError> {
        let event_func = event.func.as_deref().map(normalize_function);

        if let (Some(file), Some(line)) = (&event.file, event.line) {
            return Ok(EventLocation {
                function: event_func.unwrap_or_default(),
                file: file.clone(),
                line,
            });
        }

        if let Some(addr) = event.addr {
            if let Resolution::Resolved(info) = self.resolver.resolve(addr)? {
                let function = normalize_function(&info.function);
                let function = if function.is_empty() || function == "unknown" {
                    event_func.clone().unwrap_or(function)
                } else {
                    function
                };
                return Ok(EventLocation {
                    function,
                    file: info.file,
                    line: info.line,
                });
            }
        }

        Ok(EventLocation {
            function: event_func.unwrap_or_default(),
            file: String::new(),
            line: 0,
        })
    }

    fn process_event(&mut self, event: &RawEvent) -> Result<(), ConvertError> {
        let location = self.locate(event)?;

        let classification = self.classifier.classify(&event.kind, &location);
        if classification.decision == FilterDecision::Drop {
            return Ok(());
        }
        if self.classifier.is_noise(&location) {
            return Ok(());
        }

        if location.line != 0 {
            if let Some(op) = self.input_lines.shift_remove(&location.line) {
                self.emit_input_request(op, &location);
            }
        }

        self.dispatch(event, &location);
        Ok(())
    }

    fn dispatch(&mut self, event: &RawEvent, location: &EventLocation) {
        match &event.kind {
            EventKind::FuncEnter => self.on_func_enter(location),
            EventKind::FuncExit => self.on_func_exit(location),
            EventKind::Return => self.on_return(event, location),
            EventKind::BlockEnter => self.on_block_enter(event, location),
            EventKind::BlockExit => self.on_block_exit(location),
            EventKind::LoopStart => self.on_loop_start(event, location),
            EventKind::LoopBodyStart => self.on_loop_body_start(event, location),
            EventKind::LoopIterationEnd => self.on_loop_iteration_end(event, location),
            EventKind::LoopEnd => self.on_loop_end(event, location),
            EventKind::LoopCondition => self.on_loop_condition(event, location),
            EventKind::ControlFlow => self.on_control_flow(event, location),
            EventKind::ConditionEval => self.on_condition(event, location, StepKind::ConditionEval),
            EventKind::BranchTaken => self.on_condition(event, location, StepKind::BranchTaken),
            EventKind::Declare => self.on_declare(event, location),
            EventKind::Assign => self.on_assign(event, location),
            EventKind::ArgBind => self.on_arg_bind(event, location),
            EventKind::ExpressionEval => self.on_expression_eval(event, location),
            EventKind::ArrayCreate => self.on_array_create(event, location),
            EventKind::ArrayIndexAssign => self.on_array_index_assign(event, location),
            EventKind::PointerAlias => self.on_pointer_alias(event, location),
            EventKind::PointerDerefWrite => self.on_pointer_deref_write(event, location),
            EventKind::HeapAlloc => self.on_heap(event, location, StepKind::HeapAlloc),
            EventKind::HeapFree => self.on_heap(event, location, StepKind::HeapFree),
            EventKind::HeapWrite => self.on_heap(event, location, StepKind::HeapWrite),
            EventKind::Other(tag) => self.on_unknown(event, tag.clone(), location),
        }
    }

    // Frame lifecycle.

    fn open_program(&mut self) {
        let ordinal = self.next_ordinal("main");
        let frame = Frame::new(format!("main-{ordinal}"), "main".to_owned(), 0, None);
        self.main_metadata = frame.metadata();
        self.frames.push(frame);

        let start = self.synthetic_step(
            StepKind::ProgramStart,
            ScopeKind::Global,
            "Program execution started".to_owned(),
            StepPayload::Empty {},
        );
        self.push_step(start);

        let enter = self.synthetic_step(
            StepKind::FuncEnter,
            ScopeKind::Function,
            "Entered function `main`".to_owned(),
            StepPayload::Empty {},
        );
        self.push_step(enter);
    }

    fn on_func_enter(&mut self, location: &EventLocation) {
        let function = {
            let name = normalize_function(&location.function);
            if name.is_empty() {
                "unknown".to_owned()
            } else {
                name
            }
        };
        self.tracked.insert(function.clone());

        if function == "main"
            && !self.main_claimed
            && self.frames.len() == 1
            && self.frames.top().is_some_and(|f| f.function_name == "main")
        {
            // the synthetic prefix already opened this activation
            self.main_claimed = true;
            return;
        }

        self.global_call_index += 1;
        let ordinal = self.next_ordinal(&function);
        let frame = Frame::new(
            format!("{function}-{ordinal}"),
            function.clone(),
            self.global_call_index,
            self.frames.top(),
        );
        let metadata = frame.metadata();
        self.frames.push(frame);

        let step = Step {
            step_index: None,
            internal_step_index: None,
            event_type: StepKind::FuncEnter,
            line: location.line,
            function: function.clone(),
            scope: ScopeKind::Function,
            file: self.step_file(location),
            timestamp: 0,
            explanation: format!("Entered function `{function}`"),
            internal_events: Vec::new(),
            frame: metadata,
            payload: StepPayload::Empty {},
        };
        self.push_step(step);
    }

    fn on_func_exit(&mut self, location: &EventLocation) {
        if self.frames.is_empty() {
            tracing::warn!("func_exit with no live frame, dropping event");
            return;
        }
        if self.frames.len() == 1 && self.frames.top().is_some_and(|f| f.function_name == "main") {
            // main's exit is synthesised after the output steps are appended
            return;
        }

        let Some(mut frame) = self.frames.pop() else {
            return;
        };
        let destroyed = frame.drain_scope_variables();
        let metadata = frame.metadata();
        let function = frame.function_name;

        if !destroyed.is_empty() {
            let destroyed: Vec<String> = destroyed.into_iter().collect();
            let step = Step {
                step_index: None,
                internal_step_index: None,
                event_type: StepKind::ScopeExit,
                line: location.line,
                function: function.clone(),
                scope: ScopeKind::Function,
                file: self.step_file(location),
                timestamp: 0,
                explanation: format!("Scope of `{function}` ended, destroying: {}", destroyed.join(", ")),
                internal_events: Vec::new(),
                frame: metadata.clone(),
                payload: StepPayload::ScopeExit {
                    scope_type: ScopeRecordKind::Function,
                    destroyed_symbols: destroyed,
                },
            };
            self.push_step(step);
        }

        let step = Step {
            step_index: None,
            internal_step_index: None,
            event_type: StepKind::FuncExit,
            line: location.line,
            function: function.clone(),
            scope: ScopeKind::Function,
            file: self.step_file(location),
            timestamp: 0,
            explanation: format!("Returned from `{function}`"),
            internal_events: Vec::new(),
            frame: metadata,
            payload: StepPayload::Empty {},
        };
        self.push_step(step);
    }

    /// End-of-stream closure: synthesises `main`'s exit if the trace never
    /// emitted one. Other unclosed frames are left alone.
    fn close_main(&mut self) {
        let Some(mut frame) = self.frames.take_main() else {
            return;
        };
        let destroyed = frame.drain_scope_variables();
        let metadata = frame.metadata();

        if !destroyed.is_empty() {
            let destroyed: Vec<String> = destroyed.into_iter().collect();
            let step = Step {
                step_index: None,
                internal_step_index: None,
                event_type: StepKind::ScopeExit,
                line: 0,
                function: "main".to_owned(),
                scope: ScopeKind::Function,
                file: self.source_file.clone(),
                timestamp: 0,
                explanation: format!("Scope of `main` ended, destroying: {}", destroyed.join(", ")),
                internal_events: Vec::new(),
                frame: metadata.clone(),
                payload: StepPayload::ScopeExit {
                    scope_type: ScopeRecordKind::Function,
                    destroyed_symbols: destroyed,
                },
            };
            self.push_step(step);
        }

        let step = Step {
            step_index: None,
            internal_step_index: None,
            event_type: StepKind::FuncExit,
            line: 0,
            function: "main".to_owned(),
            scope: ScopeKind::Function,
            file: self.source_file.clone(),
            timestamp: 0,
            explanation: "Returned from `main`".to_owned(),
            internal_events: Vec::new(),
            frame: metadata,
            payload: StepPayload::Empty {},
        };
        self.push_step(step);
    }

    // Block scopes.

    fn on_block_enter(&mut self, event: &RawEvent, location: &EventLocation) {
        if let Some(frame) = self.frames.top_mut() {
            frame.scope_stack.push(ScopeRecord::block(event.block_depth));
        }
        let step = self.make_step(
            StepKind::BlockEnter,
            location,
            "Entered a block scope".to_owned(),
            StepPayload::Empty {},
        );
        self.push_step(step);
    }

    fn on_block_exit(&mut self, location: &EventLocation) {
        let destroyed = match self.frames.top_mut() {
            Some(frame)
                if frame
                    .scope_stack
                    .last()
                    .is_some_and(|s| s.kind == ScopeRecordKind::Block) =>
            {
                frame.scope_stack.pop().map(|s| s.variables)
            }
            _ => None,
        };

        if let Some(variables) = destroyed {
            if !variables.is_empty() {
                let destroyed: Vec<String> = variables.into_iter().collect();
                let step = self.make_step(
                    StepKind::ScopeExit,
                    location,
                    format!("Block ended, destroying: {}", destroyed.join(", ")),
                    StepPayload::ScopeExit {
                        scope_type: ScopeRecordKind::Block,
                        destroyed_symbols: destroyed,
                    },
                );
                self.push_step(step);
            }
        }

        let step = self.make_step(
            StepKind::BlockExit,
            location,
            "Left a block scope".to_owned(),
            StepPayload::Empty {},
        );
        self.push_step(step);
    }

    // Data events.

    fn on_declare(&mut self, event: &RawEvent, location: &EventLocation) {
        let Some(name) = event.name.as_deref() else {
            tracing::warn!("declare event without a name, dropping");
            return;
        };

        let frame_id = self.current_metadata().frame_id;
        if !self.declared.insert(format!("{frame_id}:{name}")) {
            return;
        }

        if let Some(frame) = self.frames.top_mut() {
            frame.declare(name);
        }
        if let Some(addr) = event.addr {
            self.frames.register_address(addr, name, &frame_id);
        }

        let explanation = match &event.value {
            Some(value) => format!("Declared variable `{name}` with value {}", fmt_value(value)),
            None => format!("Declared variable `{name}`"),
        };
        let step = self.make_step(
            StepKind::VarDeclare,
            location,
            explanation,
            StepPayload::Var {
                symbol: name.to_owned(),
                value: event.value.clone(),
                memory_region: None,
            },
        );
        self.push_step(step);
    }

    fn on_assign(&mut self, event: &RawEvent, location: &EventLocation) {
        let Some(name) = event.name.as_deref() else {
            tracing::warn!("assign event without a name, dropping");
            return;
        };
        let explanation = match &event.value {
            Some(value) => format!("Assigned {} to `{name}`", fmt_value(value)),
            None => format!("Assigned a new value to `{name}`"),
        };
        let step = self.make_step(
            StepKind::VarAssign,
            location,
            explanation,
            StepPayload::Var {
                symbol: name.to_owned(),
                value: event.value.clone(),
                memory_region: None,
            },
        );
        self.push_step(step);
    }

    fn on_arg_bind(&mut self, event: &RawEvent, location: &EventLocation) {
        let Some(name) = event.name.as_deref() else {
            return;
        };
        let explanation = match &event.value {
            Some(value) => format!("Bound argument {} to parameter `{name}`", fmt_value(value)),
            None => format!("Bound an argument to parameter `{name}`"),
        };
        let step = self.make_step(
            StepKind::ArgBind,
            location,
            explanation,
            StepPayload::Var {
                symbol: name.to_owned(),
                value: event.value.clone(),
                memory_region: None,
            },
        );
        self.push_step(step);
    }

    fn on_expression_eval(&mut self, event: &RawEvent, location: &EventLocation) {
        let symbol = event.name.clone().unwrap_or_default();
        let explanation = match &event.value {
            Some(value) => format!("Evaluated `{symbol}` to {}", fmt_value(value)),
            None => format!("Evaluated `{symbol}`"),
        };
        let step = self.make_step(
            StepKind::ExpressionEval,
            location,
            explanation,
            StepPayload::Var {
                symbol,
                value: event.value.clone(),
                memory_region: None,
            },
        );
        self.push_step(step);
    }

    // Arrays and heap.

    fn on_array_create(&mut self, event: &RawEvent, location: &EventLocation) {
        let Some(name) = event.name.as_deref() else {
            tracing::warn!("array_create event without a name, dropping");
            return;
        };

        let frame_id = self.current_metadata().frame_id;
        if let Some(frame) = self.frames.top_mut() {
            frame.declare(name);
        }
        if let Some(addr) = event.addr {
            self.frames.register_address(addr, name, &frame_id);
        }

        let step = self.make_step(
            StepKind::ArrayCreate,
            location,
            format!("Created array `{name}`"),
            StepPayload::Array {
                symbol: name.to_owned(),
                dimensions: event.dimensions.clone(),
                indices: None,
                value: None,
                memory_region: MemoryRegion::Stack,
            },
        );
        self.push_step(step);
    }

    fn on_array_index_assign(&mut self, event: &RawEvent, location: &EventLocation) {
        let Some(name) = event.name.as_deref() else {
            return;
        };
        let indices = event.indices.clone().unwrap_or_default();
        let rendered: Vec<String> = indices.iter().map(u32::to_string).collect();
        let explanation = match &event.value {
            Some(value) => format!(
                "Assigned {} to `{name}[{}]`",
                fmt_value(value),
                rendered.join("][")
            ),
            None => format!("Assigned to an element of `{name}`"),
        };
        let step = self.make_step(
            StepKind::ArrayIndexAssign,
            location,
            explanation,
            StepPayload::Array {
                symbol: name.to_owned(),
                dimensions: None,
                indices: event.indices.clone(),
                value: event.value.clone(),
                memory_region: MemoryRegion::Stack,
            },
        );
        self.push_step(step);
    }

    fn on_heap(&mut self, event: &RawEvent, location: &EventLocation, kind: StepKind) {
        if kind == StepKind::HeapAlloc {
            if let (Some(addr), Some(name)) = (event.addr, event.name.as_deref()) {
                let frame_id = self.current_metadata().frame_id;
                self.frames.register_address(addr, name, &frame_id);
            }
        }

        let explanation = match (&kind, event.size) {
            (StepKind::HeapAlloc, Some(size)) => format!("Allocated {size} bytes on the heap"),
            (StepKind::HeapAlloc, None) => "Allocated memory on the heap".to_owned(),
            (StepKind::HeapFree, _) => "Freed heap memory".to_owned(),
            _ => "Wrote to heap memory".to_owned(),
        };
        let step = self.make_step(
            kind,
            location,
            explanation,
            StepPayload::Heap {
                symbol: event.name.clone(),
                address: event.addr,
                size: event.size,
                value: event.value.clone(),
                memory_region: MemoryRegion::Heap,
            },
        );
        self.push_step(step);
    }

    // Pointers.

    fn on_pointer_alias(&mut self, event: &RawEvent, location: &EventLocation) {
        let Some(pointer) = event.pointer_name.as_deref().or(event.name.as_deref()) else {
            tracing::warn!("pointer_alias event without a pointer name, dropping");
            return;
        };
        let alias_of = event.alias_of.clone().unwrap_or_default();
        let is_heap = event.is_heap.unwrap_or(false);

        if let Some(frame) = self.frames.top_mut() {
            frame.pointer_aliases.insert(
                pointer.to_owned(),
                PointerAlias {
                    alias_of: alias_of.clone(),
                    aliased_address: event.aliased_address,
                    is_heap,
                },
            );
            frame.declare(pointer);
        }

        let region = if is_heap {
            MemoryRegion::Heap
        } else {
            MemoryRegion::Stack
        };
        let explanation = if alias_of.is_empty() {
            format!("`{pointer}` now points to {region} memory")
        } else {
            format!("`{pointer}` now points to `{alias_of}` on the {region}")
        };
        let step = self.make_step(
            StepKind::PointerAlias,
            location,
            explanation,
            StepPayload::Pointer {
                symbol: pointer.to_owned(),
                points_to: PointsTo {
                    region,
                    target: (!alias_of.is_empty()).then_some(alias_of),
                    address: event.aliased_address,
                },
            },
        );
        self.push_step(step);
    }

    fn on_pointer_deref_write(&mut self, event: &RawEvent, location: &EventLocation) {
        let Some(pointer) = event.pointer_name.as_deref().or(event.name.as_deref()) else {
            tracing::warn!("pointer_deref_write event without a pointer name, dropping");
            return;
        };

        let target = self.frames.resolve_pointer(pointer);
        let points_to = match &target {
            Some(t) => PointsTo {
                region: t.region,
                target: t.name.clone(),
                address: t.address,
            },
            None => PointsTo {
                region: MemoryRegion::Unknown,
                target: None,
                address: None,
            },
        };

        let explanation = match (&event.value, &points_to.target) {
            (Some(value), Some(name)) => format!(
                "Wrote {} through `*{pointer}`, changing `{name}`",
                fmt_value(value)
            ),
            (Some(value), None) => format!("Wrote {} through `*{pointer}`", fmt_value(value)),
            (None, _) => format!("Wrote through `*{pointer}`"),
        };
        let step = self.make_step(
            StepKind::PointerDerefWrite,
            location,
            explanation,
            StepPayload::DerefWrite {
                symbol: pointer.to_owned(),
                value: event.value.clone(),
                points_to,
            },
        );
        self.push_step(step);

        // `*p = v` rewrites the pointee's observable value; surface that as
        // an ordinary assignment when the target is a named stack variable
        if let Some(target) = target {
            if let (Some(name), false) = (target.name, target.is_heap) {
                let explanation = match &event.value {
                    Some(value) => format!("Assigned {} to `{name}`", fmt_value(value)),
                    None => format!("Assigned a new value to `{name}`"),
                };
                let step = self.make_step(
                    StepKind::VarAssign,
                    location,
                    explanation,
                    StepPayload::Var {
                        symbol: name,
                        value: event.value.clone(),
                        memory_region: None,
                    },
                );
                self.push_step(step);
            }
        }
    }

    // Loops.

    fn on_loop_start(&mut self, event: &RawEvent, location: &EventLocation) {
        let Some(loop_id) = event.loop_id.clone() else {
            tracing::warn!("loop_start event without a loop id, dropping");
            return;
        };

        if let Some(frame) = self.frames.top_mut() {
            frame.active_loops.insert(loop_id.clone(), 0);
        }

        let ctx = LoopContext {
            loop_id: loop_id.clone(),
            buffer: Vec::new(),
            frame: self.current_metadata(),
            scope: self.current_scope(),
            function: self.step_function(location),
            start_line: location.line,
            start_file: self.step_file(location),
            iteration_count: 0,
        };

        let step = self.make_step(
            StepKind::LoopStart,
            location,
            "Loop started".to_owned(),
            StepPayload::Loop {
                loop_id,
                iteration: None,
            },
        );
        self.loops.push(ctx);
        self.push_step(step);
    }

    fn on_loop_body_start(&mut self, event: &RawEvent, location: &EventLocation) {
        let Some(loop_id) = event.loop_id.as_deref() else {
            tracing::warn!("loop_body_start event without a loop id, dropping");
            return;
        };
        if !self.loops.top_matches(loop_id) {
            tracing::warn!(loop_id, "loop_body_start does not match innermost loop, dropping event");
            return;
        }
        let Some(iteration) = self.loops.begin_iteration() else {
            return;
        };

        if let Some(frame) = self.frames.top_mut() {
            frame
                .scope_stack
                .push(ScopeRecord::loop_iteration(loop_id.to_owned(), iteration));
            frame.active_loops.insert(loop_id.to_owned(), iteration);
        }

        let step = self.make_step(
            StepKind::LoopBodyStart,
            location,
            format!("Loop iteration {iteration} started"),
            StepPayload::Loop {
                loop_id: loop_id.to_owned(),
                iteration: Some(iteration),
            },
        );
        self.push_step(step);
    }

    fn on_loop_iteration_end(&mut self, event: &RawEvent, location: &EventLocation) {
        let Some(loop_id) = event.loop_id.as_deref() else {
            tracing::warn!("loop_iteration_end event without a loop id, dropping");
            return;
        };
        if !self.loops.top_matches(loop_id) || !self.loops.iteration_top_matches(loop_id) {
            tracing::warn!(
                loop_id,
                "loop_iteration_end does not match innermost loop, dropping event"
            );
            return;
        }
        self.loops.end_iteration();

        let destroyed = match self.frames.top_mut() {
            Some(frame)
                if frame.scope_stack.last().is_some_and(|s| {
                    s.kind == ScopeRecordKind::LoopIteration
                        && s.loop_id.as_deref() == Some(loop_id)
                }) =>
            {
                frame.scope_stack.pop().map(|s| s.variables)
            }
            _ => None,
        };
        if let Some(variables) = destroyed {
            if !variables.is_empty() {
                let destroyed: Vec<String> = variables.into_iter().collect();
                let step = self.make_step(
                    StepKind::ScopeExit,
                    location,
                    format!("Loop iteration ended, destroying: {}", destroyed.join(", ")),
                    StepPayload::ScopeExit {
                        scope_type: ScopeRecordKind::LoopIteration,
                        destroyed_symbols: destroyed,
                    },
                );
                self.push_step(step);
            }
        }

        let iteration = self.loops.current_iteration();
        let step = self.make_step(
            StepKind::LoopIterationEnd,
            location,
            "Loop iteration finished".to_owned(),
            StepPayload::Loop {
                loop_id: loop_id.to_owned(),
                iteration,
            },
        );
        self.push_step(step);
    }

    fn on_loop_end(&mut self, event: &RawEvent, location: &EventLocation) {
        let Some(loop_id) = event.loop_id.as_deref() else {
            tracing::warn!("loop_end event without a loop id, dropping");
            return;
        };
        if !self.loops.top_matches(loop_id) {
            tracing::warn!(loop_id, "loop_end does not match innermost loop, dropping event");
            return;
        }
        let Some(ctx) = self.loops.pop() else {
            return;
        };

        if let Some(frame) = self.frames.top_mut() {
            frame.active_loops.shift_remove(loop_id);
        }

        self.emit_loop_summary(ctx);

        let step = self.make_step(
            StepKind::LoopEnd,
            location,
            "Loop finished".to_owned(),
            StepPayload::Loop {
                loop_id: loop_id.to_owned(),
                iteration: None,
            },
        );
        self.push_step(step);
    }

    fn on_loop_condition(&mut self, event: &RawEvent, location: &EventLocation) {
        let explanation = match &event.value {
            Some(value) => format!("Loop condition evaluated to {}", fmt_value(value)),
            None => "Loop condition evaluated".to_owned(),
        };
        let step = self.make_step(
            StepKind::LoopCondition,
            location,
            explanation,
            StepPayload::LoopCondition {
                loop_id: event.loop_id.clone(),
                condition_id: event.condition_id.clone(),
                value: event.value.clone(),
            },
        );
        self.push_step(step);
    }

    /// Collapses a completed loop's buffer into one summary step. The
    /// summary uses the frame metadata captured at `loop_start` and lands in
    /// the enclosing loop's buffer when one is still active.
    fn emit_loop_summary(&mut self, ctx: LoopContext) {
        let LoopContext {
            loop_id,
            buffer,
            frame,
            scope,
            function,
            start_line,
            start_file,
            iteration_count,
        } = ctx;

        let events: Vec<Step> = buffer
            .into_iter()
            .map(|mut step| {
                step.internal_step_index = step.step_index.take();
                step
            })
            .collect();

        let step = Step {
            step_index: None,
            internal_step_index: None,
            event_type: StepKind::LoopBodySummary,
            line: start_line,
            function,
            scope,
            file: start_file,
            timestamp: 0,
            explanation: format!(
                "Loop body ran {iteration_count} iteration(s), {} steps collapsed",
                events.len()
            ),
            internal_events: Vec::new(),
            frame,
            payload: StepPayload::LoopSummary {
                loop_id,
                iterations: iteration_count,
                events,
            },
        };
        self.push_step(step);
    }

    /// Pops loops the trace never closed, innermost first, so no buffered
    /// step is ever lost.
    fn flush_orphan_loops(&mut self) {
        self.loops.clear_iterations();
        while let Some(ctx) = self.loops.pop() {
            tracing::warn!(loop_id = %ctx.loop_id, "loop still open at end of stream, flushing");
            if let Some(frame) = self.frames.top_mut() {
                frame.active_loops.shift_remove(&ctx.loop_id);
            }

            let closing = Step {
                step_index: None,
                internal_step_index: None,
                event_type: StepKind::LoopEnd,
                line: ctx.start_line,
                function: ctx.function.clone(),
                scope: ctx.scope,
                file: ctx.start_file.clone(),
                timestamp: 0,
                explanation: "Loop finished".to_owned(),
                internal_events: Vec::new(),
                frame: ctx.frame.clone(),
                payload: StepPayload::Loop {
                    loop_id: ctx.loop_id.clone(),
                    iteration: None,
                },
            };
            self.emit_loop_summary(ctx);
            self.push_step(closing);
        }
    }

    // Conditions and control flow.

    fn on_return(&mut self, event: &RawEvent, location: &EventLocation) {
        let explanation = match &event.value {
            Some(value) => format!("Returned value {}", fmt_value(value)),
            None => "Function returned".to_owned(),
        };
        let step = self.make_step(
            StepKind::Return,
            location,
            explanation,
            StepPayload::Value {
                value: event.value.clone(),
            },
        );
        self.push_step(step);
    }

    fn on_condition(&mut self, event: &RawEvent, location: &EventLocation, kind: StepKind) {
        let explanation = match (&kind, &event.value) {
            (StepKind::BranchTaken, _) => "Branch taken".to_owned(),
            (_, Some(value)) => format!("Condition evaluated to {}", fmt_value(value)),
            (_, None) => "Condition evaluated".to_owned(),
        };
        let step = self.make_step(
            kind,
            location,
            explanation,
            StepPayload::Condition {
                condition_id: event.condition_id.clone(),
                value: event.value.clone(),
            },
        );
        self.push_step(step);
    }

    fn on_control_flow(&mut self, event: &RawEvent, location: &EventLocation) {
        let action = event
            .value
            .as_ref()
            .and_then(Value::as_str)
            .unwrap_or("jump");
        let step = self.make_step(
            StepKind::ControlFlow,
            location,
            format!("Control flow: {action}"),
            StepPayload::Value {
                value: event.value.clone(),
            },
        );
        self.push_step(step);
    }

    fn on_unknown(&mut self, event: &RawEvent, tag: String, location: &EventLocation) {
        tracing::debug!(tag, "unknown event type preserved in output");
        let mut fields = event.extra.clone();
        if let Some(name) = &event.name {
            fields.insert("name".to_owned(), Value::String(name.clone()));
        }
        if let Some(value) = &event.value {
            fields.insert("value".to_owned(), value.clone());
        }
        let explanation = format!("Unrecognised event `{tag}`");
        let step = self.make_step(
            StepKind::Other(tag),
            location,
            explanation,
            StepPayload::Raw(fields),
        );
        self.push_step(step);
    }

    // Input and output.

    fn emit_input_request(&mut self, op: InputOp, location: &EventLocation) {
        let explanation = if op.prompt.is_empty() {
            "Program is waiting for input".to_owned()
        } else {
            format!("Program is waiting for input: {}", op.prompt)
        };
        let step = self.make_step(
            StepKind::InputRequest,
            location,
            explanation,
            StepPayload::input(op),
        );
        self.push_step(step);
    }

    fn emit_output_steps(&mut self, stdout: &CapturedStdout) {
        for (chunk_index, raw) in stdout.pieces() {
            let (text, escape_info) = render_chunk(raw);
            let step = Step {
                step_index: None,
                internal_step_index: None,
                event_type: StepKind::Output,
                line: 0,
                function: self.current_function(),
                scope: ScopeKind::Global,
                file: self.source_file.clone(),
                timestamp: 0,
                explanation: format!("Program printed \"{text}\""),
                internal_events: Vec::new(),
                frame: self.current_metadata(),
                payload: StepPayload::Output {
                    text,
                    raw_text: raw.to_owned(),
                    escape_info,
                    chunk_index,
                },
            };
            self.push_step(step);
        }
    }

    fn emit_program_end(&mut self) {
        let step = Step {
            step_index: None,
            internal_step_index: None,
            event_type: StepKind::ProgramEnd,
            line: 0,
            function: "main".to_owned(),
            scope: ScopeKind::Global,
            file: self.source_file.clone(),
            timestamp: 0,
            explanation: "Program execution finished".to_owned(),
            internal_events: Vec::new(),
            frame: self.main_metadata.clone(),
            payload: StepPayload::Empty {},
        };
        self.push_step(step);
    }

    /// The final renumber sweep: `steps[i].stepIndex = i`, then assert it.
    fn renumber(&mut self) -> Result<(), ConvertError> {
        for (index, step) in self.steps.iter_mut().enumerate() {
            step.step_index = Some(index);
        }
        let violated = self
            .steps
            .iter()
            .enumerate()
            .any(|(index, step)| step.step_index != Some(index));
        if violated {
            return Err(ConvertErrorKind::DeterminismViolation.into());
        }
        Ok(())
    }
}

fn fmt_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
