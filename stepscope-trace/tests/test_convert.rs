use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use similar_asserts::assert_eq;

use stepscope_common::{NoopResolver, Resolution, Resolve, ResolveError, SourceInfo};
use stepscope_trace::{
    CapturedStdout, ConvertErrorKind, Conversion, EventKind, InputKind, InputMap, InputOp,
    RawEvent, RawTrace, StepKind, StepPayload, TraceConverter,
};

const SOURCE: &str = "main.cpp";

/// An event carrying an embedded user-source location.
fn user(kind: EventKind, line: u32) -> RawEvent {
    RawEvent {
        file: Some(SOURCE.to_owned()),
        line: Some(line),
        ..RawEvent::new(kind)
    }
}

fn func_event(kind: EventKind, func: &str, line: u32) -> RawEvent {
    RawEvent {
        func: Some(func.to_owned()),
        ..user(kind, line)
    }
}

fn named(kind: EventKind, name: &str, line: u32) -> RawEvent {
    RawEvent {
        name: Some(name.to_owned()),
        ..user(kind, line)
    }
}

fn loop_event(kind: EventKind, loop_id: &str, line: u32) -> RawEvent {
    RawEvent {
        loop_id: Some(loop_id.to_owned()),
        ..user(kind, line)
    }
}

fn trace(events: Vec<RawEvent>) -> RawTrace {
    RawTrace {
        events,
        tracked_functions: Vec::new(),
    }
}

fn convert(events: Vec<RawEvent>) -> Conversion {
    convert_with_stdout(events, CapturedStdout::empty())
}

fn convert_with_stdout(events: Vec<RawEvent>, stdout: CapturedStdout) -> Conversion {
    let converter = TraceConverter::new(NoopResolver, Path::new(SOURCE));
    converter.convert(&trace(events), &stdout).unwrap()
}

fn kinds(conversion: &Conversion) -> Vec<&str> {
    conversion
        .steps
        .iter()
        .map(|s| s.event_type.as_str())
        .collect()
}

fn count_kind(conversion: &Conversion, kind: &StepKind) -> usize {
    conversion
        .steps
        .iter()
        .filter(|s| s.event_type == *kind)
        .count()
}

/// A resolver backed by a fixed address table.
struct StaticResolver(HashMap<u64, SourceInfo>);

impl Resolve for StaticResolver {
    fn resolve(&mut self, addr: u64) -> Result<Resolution, ResolveError> {
        Ok(self
            .0
            .get(&addr)
            .cloned()
            .map(Resolution::Resolved)
            .unwrap_or(Resolution::Unresolved))
    }
}

// Scenario A: hello world.

#[test]
fn test_hello_world() {
    let conversion = convert_with_stdout(
        vec![
            func_event(EventKind::FuncEnter, "main", 1),
            user(EventKind::FuncExit, 2),
        ],
        CapturedStdout::Combined {
            combined: "Hi\n".into(),
        },
    );

    assert_eq!(
        kinds(&conversion),
        vec![
            "program_start",
            "func_enter",
            "output",
            "func_exit",
            "program_end"
        ]
    );

    let output = serde_json::to_value(&conversion.steps[2]).unwrap();
    assert_eq!(output["text"], "Hi");
    assert_eq!(output["rawText"], "Hi\n");
    assert_eq!(output["escapeInfo"][0]["escape"], "\\n");
    assert_eq!(output["escapeInfo"][0]["meaning"], "newline");

    assert_eq!(count_kind(&conversion, &StepKind::FuncEnter), 1);
    assert_eq!(count_kind(&conversion, &StepKind::FuncExit), 1);
}

// Scenario B: pointer write.

#[test]
fn test_pointer_write_rewrites_target() {
    let events = vec![
        func_event(EventKind::FuncEnter, "main", 1),
        RawEvent {
            addr: Some(0x1000),
            ..named(EventKind::Declare, "x", 2)
        },
        RawEvent {
            value: Some(json!(7)),
            ..named(EventKind::Assign, "x", 2)
        },
        RawEvent {
            addr: Some(0x1008),
            ..named(EventKind::Declare, "p", 3)
        },
        RawEvent {
            pointer_name: Some("p".into()),
            alias_of: Some("x".into()),
            aliased_address: Some(0x1000),
            is_heap: Some(false),
            ..user(EventKind::PointerAlias, 3)
        },
        RawEvent {
            pointer_name: Some("p".into()),
            value: Some(json!(9)),
            ..user(EventKind::PointerDerefWrite, 4)
        },
        user(EventKind::FuncExit, 5),
    ];

    let conversion = convert(events);
    assert_eq!(
        kinds(&conversion),
        vec![
            "program_start",
            "func_enter",
            "var_declare",
            "var_assign",
            "var_declare",
            "pointer_alias",
            "pointer_deref_write",
            "var_assign",
            "scope_exit",
            "func_exit",
            "program_end"
        ]
    );

    let alias = serde_json::to_value(&conversion.steps[5]).unwrap();
    assert_eq!(alias["symbol"], "p");
    assert_eq!(alias["pointsTo"]["region"], "stack");
    assert_eq!(alias["pointsTo"]["target"], "x");
    assert_eq!(alias["pointsTo"]["address"], 0x1000);

    let deref = serde_json::to_value(&conversion.steps[6]).unwrap();
    assert_eq!(deref["symbol"], "p");
    assert_eq!(deref["value"], 9);
    assert_eq!(deref["pointsTo"]["target"], "x");

    // the semantic rewrite: `*p = 9` surfaces as an assignment to `x`
    let rewrite = serde_json::to_value(&conversion.steps[7]).unwrap();
    assert_eq!(rewrite["eventType"], "var_assign");
    assert_eq!(rewrite["symbol"], "x");
    assert_eq!(rewrite["value"], 9);

    // both variables are destroyed when main's scope drains
    let scope_exit = serde_json::to_value(&conversion.steps[8]).unwrap();
    assert_eq!(scope_exit["destroyedSymbols"], json!(["p", "x"]));
}

// Scenario C: nested loops.

fn nested_loop_iteration(events: &mut Vec<RawEvent>, outer_iter: u32) {
    events.push(loop_event(EventKind::LoopBodyStart, "L1", 2));
    events.push(RawEvent {
        value: Some(json!(outer_iter - 1)),
        ..named(EventKind::Assign, "i", 2)
    });
    events.push(loop_event(EventKind::LoopStart, "L2", 3));
    for inner_iter in 0..2 {
        events.push(loop_event(EventKind::LoopBodyStart, "L2", 3));
        events.push(RawEvent {
            value: Some(json!(inner_iter)),
            ..named(EventKind::Assign, "j", 3)
        });
        events.push(loop_event(EventKind::LoopIterationEnd, "L2", 3));
    }
    events.push(loop_event(EventKind::LoopEnd, "L2", 3));
    events.push(loop_event(EventKind::LoopIterationEnd, "L1", 2));
}

#[test]
fn test_nested_loop_summaries() {
    let mut events = vec![
        func_event(EventKind::FuncEnter, "main", 1),
        loop_event(EventKind::LoopStart, "L1", 2),
    ];
    nested_loop_iteration(&mut events, 1);
    nested_loop_iteration(&mut events, 2);
    events.push(loop_event(EventKind::LoopEnd, "L1", 2));
    events.push(user(EventKind::FuncExit, 6));

    let conversion = convert(events);

    let expected_skeleton = vec![
        "program_start",
        "func_enter",
        "loop_start",        // L1
        "loop_body_start",   // L1 iter 1
        "loop_start",        // L2
        "loop_body_start",   // L2 iter 1
        "loop_iteration_end",
        "loop_body_start",   // L2 iter 2
        "loop_iteration_end",
        "loop_end",          // L2 (its summary is buffered into L1)
        "loop_iteration_end",
        "loop_body_start",   // L1 iter 2
        "loop_start",
        "loop_body_start",
        "loop_iteration_end",
        "loop_body_start",
        "loop_iteration_end",
        "loop_end",
        "loop_iteration_end",
        "loop_body_summary", // L1 collapses with no loop active
        "loop_end",          // L1
        "func_exit",
        "program_end",
    ];
    assert_eq!(kinds(&conversion), expected_skeleton);

    let summary = conversion
        .steps
        .iter()
        .find(|s| s.event_type == StepKind::LoopBodySummary)
        .unwrap();
    let StepPayload::LoopSummary {
        loop_id,
        iterations,
        events,
    } = &summary.payload
    else {
        panic!("summary step without a summary payload");
    };
    assert_eq!(loop_id, "L1");
    assert_eq!(*iterations, 2);

    // two `i` assignments plus two collapsed L2 summaries
    let buffered: Vec<&str> = events.iter().map(|s| s.event_type.as_str()).collect();
    assert_eq!(
        buffered,
        vec![
            "var_assign",
            "loop_body_summary",
            "var_assign",
            "loop_body_summary"
        ]
    );

    // buffered steps carry internalStepIndex instead of stepIndex
    for step in events {
        assert_eq!(step.step_index, None);
        assert!(step.internal_step_index.is_some());
    }

    // the nested L2 summary carries its own buffered `j` assignments
    let StepPayload::LoopSummary {
        loop_id, events, ..
    } = &events[1].payload
    else {
        panic!("nested summary missing");
    };
    assert_eq!(loop_id, "L2");
    assert_eq!(events.len(), 2);

    // summaries display the frame captured at loop_start
    assert_eq!(summary.frame.frame_id, "main-0");
}

// Scenario D: mismatched inner loop_end.

#[test]
fn test_mismatched_loop_end_is_dropped_and_flushed() {
    let events = vec![
        func_event(EventKind::FuncEnter, "main", 1),
        loop_event(EventKind::LoopStart, "L1", 2),
        loop_event(EventKind::LoopBodyStart, "L1", 2),
        loop_event(EventKind::LoopStart, "L2", 3),
        loop_event(EventKind::LoopBodyStart, "L2", 3),
        RawEvent {
            value: Some(json!(0)),
            ..named(EventKind::Assign, "j", 3)
        },
        loop_event(EventKind::LoopIterationEnd, "L2", 3),
        // the inner loop_end arrives with the wrong id and must be dropped
        loop_event(EventKind::LoopEnd, "L1", 3),
        loop_event(EventKind::LoopIterationEnd, "L1", 2),
        loop_event(EventKind::LoopEnd, "L1", 2),
    ];

    let conversion = convert(events);

    // exactly one loop_start and one loop_end per loop id
    for id in ["L1", "L2"] {
        let starts = conversion
            .steps
            .iter()
            .filter(|s| {
                s.event_type == StepKind::LoopStart
                    && matches!(&s.payload, StepPayload::Loop { loop_id, .. } if loop_id == id)
            })
            .count();
        let ends = conversion
            .steps
            .iter()
            .filter(|s| {
                s.event_type == StepKind::LoopEnd
                    && matches!(&s.payload, StepPayload::Loop { loop_id, .. } if loop_id == id)
            })
            .count();
        assert_eq!((starts, ends), (1, 1), "loop {id}");
    }

    // L2's summary still exists, nested inside L1's
    let l1_summary = conversion
        .steps
        .iter()
        .find(|s| s.event_type == StepKind::LoopBodySummary)
        .unwrap();
    let StepPayload::LoopSummary { events, .. } = &l1_summary.payload else {
        panic!("summary step without a summary payload");
    };
    assert!(events.iter().any(|s| {
        matches!(&s.payload, StepPayload::LoopSummary { loop_id, .. } if loop_id == "L2")
    }));

    // frame balance still holds
    assert_eq!(
        count_kind(&conversion, &StepKind::FuncEnter),
        count_kind(&conversion, &StepKind::FuncExit)
    );
}

// Scenario E: input detection fires once.

#[test]
fn test_input_request_single_fire() {
    let mut input_lines = InputMap::new();
    input_lines.insert(
        5,
        InputOp {
            kind: InputKind::Cin,
            variables: vec!["n".into(), "m".into()],
            format: None,
            prompt: "Enter two numbers".into(),
        },
    );

    let events = vec![
        func_event(EventKind::FuncEnter, "main", 1),
        RawEvent {
            value: Some(json!(3)),
            ..named(EventKind::Assign, "n", 5)
        },
        RawEvent {
            value: Some(json!(4)),
            ..named(EventKind::Assign, "m", 5)
        },
        user(EventKind::FuncExit, 6),
    ];

    let mut converter = TraceConverter::new(NoopResolver, Path::new(SOURCE));
    converter.set_input_lines(input_lines);
    let conversion = converter
        .convert(&trace(events), &CapturedStdout::empty())
        .unwrap();

    assert_eq!(
        kinds(&conversion),
        vec![
            "program_start",
            "func_enter",
            "input_request",
            "var_assign",
            "var_assign",
            "func_exit",
            "program_end"
        ]
    );

    let request = serde_json::to_value(&conversion.steps[2]).unwrap();
    assert_eq!(request["type"], "cin");
    assert_eq!(request["variables"], json!(["n", "m"]));
    assert_eq!(request["pauseExecution"], true);
    assert_eq!(request["line"], 5);
}

// Scenario F: full resolver failure keeps structure only.

#[test]
fn test_unresolved_trace_keeps_structure() {
    let events = vec![
        RawEvent {
            func: Some("main".into()),
            addr: Some(0x10),
            ..RawEvent::new(EventKind::FuncEnter)
        },
        RawEvent {
            func: Some("compute".into()),
            addr: Some(0x20),
            ..RawEvent::new(EventKind::FuncEnter)
        },
        RawEvent {
            name: Some("a".into()),
            addr: Some(0x30),
            ..RawEvent::new(EventKind::Declare)
        },
        RawEvent {
            name: Some("b".into()),
            addr: Some(0x40),
            ..RawEvent::new(EventKind::Declare)
        },
        RawEvent {
            addr: Some(0x50),
            ..RawEvent::new(EventKind::FuncExit)
        },
    ];

    let conversion = convert(events);

    assert_eq!(
        kinds(&conversion),
        vec![
            "program_start",
            "func_enter", // main
            "func_enter", // compute, kept as structural
            "func_exit",
            "func_exit", // main, synthesised
            "program_end"
        ]
    );

    // no fabricated user source locations
    let compute_enter = &conversion.steps[2];
    assert_eq!(compute_enter.file, "");
    assert_eq!(compute_enter.line, 0);
    assert_eq!(compute_enter.function, "compute");

    assert!(conversion.tracked_functions.contains("compute"));
    assert!(conversion.tracked_functions.contains("main"));
}

// Universal invariants.

fn busy_trace() -> Vec<RawEvent> {
    let mut events = vec![
        func_event(EventKind::FuncEnter, "main", 1),
        RawEvent {
            addr: Some(0x1000),
            value: Some(json!(1)),
            ..named(EventKind::Declare, "x", 2)
        },
        func_event(EventKind::FuncEnter, "helper", 10),
        named(EventKind::ArgBind, "n", 10),
        RawEvent {
            value: Some(json!(5)),
            ..named(EventKind::Return, "n", 11)
        },
        user(EventKind::FuncExit, 12),
        loop_event(EventKind::LoopStart, "L1", 3),
    ];
    for i in 0..3 {
        events.push(loop_event(EventKind::LoopBodyStart, "L1", 3));
        events.push(RawEvent {
            value: Some(json!(i)),
            ..named(EventKind::Assign, "x", 4)
        });
        events.push(loop_event(EventKind::LoopIterationEnd, "L1", 3));
    }
    events.push(loop_event(EventKind::LoopEnd, "L1", 3));
    events.push(RawEvent {
        addr: Some(0xbeef_0000),
        name: Some("buf".into()),
        size: Some(64),
        is_heap: Some(true),
        ..user(EventKind::HeapAlloc, 5)
    });
    events.push(RawEvent {
        addr: Some(0xbeef_0000),
        ..user(EventKind::HeapFree, 6)
    });
    events.push(user(EventKind::FuncExit, 7));
    events
}

#[test]
fn test_renumber_and_timestamp_invariants() {
    let conversion = convert(busy_trace());

    for (index, step) in conversion.steps.iter().enumerate() {
        assert_eq!(step.step_index, Some(index));
    }

    for pair in conversion.steps.windows(2) {
        assert!(
            pair[0].timestamp < pair[1].timestamp,
            "timestamps must strictly increase"
        );
    }
}

#[test]
fn test_frame_and_loop_balance() {
    let conversion = convert(busy_trace());

    assert_eq!(
        count_kind(&conversion, &StepKind::FuncEnter),
        count_kind(&conversion, &StepKind::FuncExit)
    );
    assert_eq!(
        count_kind(&conversion, &StepKind::LoopBodyStart),
        count_kind(&conversion, &StepKind::LoopIterationEnd)
    );
    assert_eq!(count_kind(&conversion, &StepKind::LoopStart), 1);
    assert_eq!(count_kind(&conversion, &StepKind::LoopEnd), 1);

    // replaying enter/exit pairs drains to an empty stack
    let mut depth: i64 = 0;
    for step in &conversion.steps {
        match step.event_type {
            StepKind::FuncEnter => depth += 1,
            StepKind::FuncExit => {
                depth -= 1;
                assert!(depth >= 0);
            }
            _ => {}
        }
    }
    assert_eq!(depth, 0);
}

#[test]
fn test_tracked_functions_superset() {
    let conversion = convert(busy_trace());
    for name in ["main", "helper"] {
        assert!(conversion.tracked_functions.contains(name), "{name}");
    }
}

// Round-trip / idempotence.

#[test]
fn test_determinism() {
    let first = convert(busy_trace());
    let second = convert(busy_trace());

    let first = serde_json::to_string(&first).unwrap();
    let second = serde_json::to_string(&second).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_resolver_absence_preserves_structure() {
    // events carry addresses only, so everything rides on the resolver
    let table: HashMap<u64, SourceInfo> = [
        (0x10, ("main", 1)),
        (0x20, ("main", 3)),
        (0x21, ("main", 3)),
        (0x22, ("main", 3)),
        (0x23, ("main", 3)),
        (0x30, ("main", 4)),
        (0x40, ("main", 7)),
    ]
    .into_iter()
    .map(|(addr, (function, line))| {
        (
            addr,
            SourceInfo {
                function: function.to_owned(),
                file: SOURCE.to_owned(),
                line,
            },
        )
    })
    .collect();

    let events = || {
        vec![
            RawEvent {
                func: Some("main".into()),
                addr: Some(0x10),
                ..RawEvent::new(EventKind::FuncEnter)
            },
            RawEvent {
                loop_id: Some("L1".into()),
                addr: Some(0x20),
                ..RawEvent::new(EventKind::LoopStart)
            },
            RawEvent {
                loop_id: Some("L1".into()),
                addr: Some(0x21),
                ..RawEvent::new(EventKind::LoopBodyStart)
            },
            RawEvent {
                loop_id: Some("L1".into()),
                addr: Some(0x22),
                ..RawEvent::new(EventKind::LoopIterationEnd)
            },
            RawEvent {
                loop_id: Some("L1".into()),
                addr: Some(0x23),
                ..RawEvent::new(EventKind::LoopEnd)
            },
            // a data event after the loop, so it lands in the global sequence
            RawEvent {
                name: Some("x".into()),
                value: Some(json!(1)),
                addr: Some(0x30),
                ..RawEvent::new(EventKind::Assign)
            },
            RawEvent {
                addr: Some(0x40),
                ..RawEvent::new(EventKind::FuncExit)
            },
        ]
    };

    let resolved = TraceConverter::new(StaticResolver(table), Path::new(SOURCE))
        .convert(&trace(events()), &CapturedStdout::empty())
        .unwrap();
    let unresolved = TraceConverter::new(NoopResolver, Path::new(SOURCE))
        .convert(&trace(events()), &CapturedStdout::empty())
        .unwrap();

    for kind in [
        StepKind::FuncEnter,
        StepKind::FuncExit,
        StepKind::LoopStart,
        StepKind::LoopBodyStart,
        StepKind::LoopIterationEnd,
        StepKind::LoopEnd,
    ] {
        assert_eq!(
            count_kind(&resolved, &kind),
            count_kind(&unresolved, &kind),
            "{kind:?}"
        );
    }

    // the data event is dropped without a resolver, nothing else changes
    assert_eq!(count_kind(&resolved, &StepKind::VarAssign), 1);
    assert_eq!(count_kind(&unresolved, &StepKind::VarAssign), 0);
}

// Boundary behaviour.

#[test]
fn test_zero_events_is_fatal() {
    let converter = TraceConverter::new(NoopResolver, Path::new(SOURCE));
    let err = converter
        .convert(&trace(Vec::new()), &CapturedStdout::empty())
        .unwrap_err();
    assert_eq!(err.kind(), ConvertErrorKind::InstrumentationInactive);
}

#[test]
fn test_unclosed_function_stays_open() {
    let conversion = convert(vec![func_event(EventKind::FuncEnter, "foo", 3)]);

    assert_eq!(
        kinds(&conversion),
        vec![
            "program_start",
            "func_enter", // main
            "func_enter", // foo, never closed
            "func_exit",  // main only
            "program_end"
        ]
    );
    assert!(conversion.tracked_functions.contains("foo"));

    for (index, step) in conversion.steps.iter().enumerate() {
        assert_eq!(step.step_index, Some(index));
    }
}

#[test]
fn test_stray_loop_end_equivalent_to_removal() {
    let base = vec![
        func_event(EventKind::FuncEnter, "main", 1),
        loop_event(EventKind::LoopStart, "L1", 2),
        loop_event(EventKind::LoopBodyStart, "L1", 2),
        RawEvent {
            value: Some(json!(0)),
            ..named(EventKind::Assign, "i", 3)
        },
        loop_event(EventKind::LoopIterationEnd, "L1", 2),
        loop_event(EventKind::LoopEnd, "L1", 2),
        user(EventKind::FuncExit, 5),
    ];

    let mut with_stray = base.clone();
    // a loop_end for a loop that is not innermost is dropped outright
    with_stray.insert(5, loop_event(EventKind::LoopEnd, "L9", 2));

    let clean = convert(base);
    let noisy = convert(with_stray);
    assert_eq!(clean.steps, noisy.steps);
}

// Cancellation.

#[test]
fn test_cancelled_conversion_is_well_formed() {
    let flag = Arc::new(AtomicBool::new(true));
    flag.store(true, Ordering::Relaxed);

    let mut converter = TraceConverter::new(NoopResolver, Path::new(SOURCE));
    converter.set_cancel_flag(flag);
    let conversion = converter
        .convert(&trace(busy_trace()), &CapturedStdout::empty())
        .unwrap();

    // no event was consumed, but the envelope is complete and renumbered
    assert_eq!(
        kinds(&conversion),
        vec!["program_start", "func_enter", "func_exit", "program_end"]
    );
    for (index, step) in conversion.steps.iter().enumerate() {
        assert_eq!(step.step_index, Some(index));
    }
}

// Unknown events.

#[test]
fn test_unknown_event_preserved() {
    let mut event = user(EventKind::Other("vtable_patch".into()), 4);
    event.extra.insert("slot".into(), json!(3));

    let conversion = convert(vec![
        func_event(EventKind::FuncEnter, "main", 1),
        event,
        user(EventKind::FuncExit, 5),
    ]);

    let step = &conversion.steps[2];
    assert_eq!(step.event_type.as_str(), "vtable_patch");
    let json = serde_json::to_value(step).unwrap();
    assert_eq!(json["slot"], 3);
}

// Chunked stdout.

#[test]
fn test_chunked_stdout_ordering() {
    let conversion = convert_with_stdout(
        vec![
            func_event(EventKind::FuncEnter, "main", 1),
            user(EventKind::FuncExit, 2),
        ],
        CapturedStdout::Chunks {
            chunks: vec!["second\n".into(), "first\n".into()],
            timestamps: Some(vec![200, 100]),
        },
    );

    let outputs: Vec<serde_json::Value> = conversion
        .steps
        .iter()
        .filter(|s| s.event_type == StepKind::Output)
        .map(|s| serde_json::to_value(s).unwrap())
        .collect();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0]["text"], "first");
    assert_eq!(outputs[0]["chunkIndex"], 1);
    assert_eq!(outputs[1]["text"], "second");
    assert_eq!(outputs[1]["chunkIndex"], 0);
}
