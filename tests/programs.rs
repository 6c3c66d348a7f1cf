use std::cell::Cell;
use std::rc::Rc;

use vecpipe::common::word_from_raw;
use vecpipe::config::{CacheConfig, MemoryConfig, SystemConfig};
use vecpipe::instruction::assembler::assemble_program;
use vecpipe::instruction::instruction::{Instruction, RawInstruction};
use vecpipe::pipeline::pipeline::{CompletionCallback, RunReport};
use vecpipe::register::register_system::{COND_REG, LINK_REG};
use vecpipe::system::system::{MemoryMode, System};

fn assemble(source: &str) -> Vec<RawInstruction> {
    assemble_program(source)
        .unwrap()
        .iter()
        .map(Instruction::encode)
        .collect()
}

fn load(source: &str, start: usize, config: SystemConfig) -> System {
    let mut system = System::new(config).unwrap();
    system.load_program(start, &assemble(source)).unwrap();
    system
}

fn counting_callback() -> (Rc<Cell<usize>>, CompletionCallback) {
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    (
        calls,
        Box::new(move |_: &RunReport| counter.set(counter.get() + 1)),
    )
}

#[test]
fn load_then_add_stalls_for_producer() {
    let mut system = load("LOAD R0 0\nADD R0 R0 1", 0, SystemConfig::default());
    let report = system.run_to_completion(0).unwrap();
    assert_eq!(1, system.registers.read(0));
    assert_eq!(2, report.retired);
    assert!(report.stalls > 0);
}

#[test]
fn store_program_at_1000_completes_once() {
    let config = SystemConfig {
        memory: MemoryConfig {
            lines: 8000,
            delay: 3,
        },
        cache: CacheConfig {
            lines: 16,
            write_allocate: false,
        },
        ..SystemConfig::default()
    };
    let mut system = load("STORE R1 R0", 1000, config);
    system.registers.write_normal(42, 0);
    system.registers.write_normal(500, 1);

    let (calls, on_complete) = counting_callback();
    let report = system
        .run(1000, true, MemoryMode::Cache, Some(on_complete))
        .unwrap();

    assert_eq!(1, calls.get());
    assert_eq!(42, system.memory().peek(500));
    assert_eq!(Some(1), report.halt_id);
    assert_eq!(1, report.retired);
}

#[test]
fn branch_waits_for_compare() {
    let source = "
        LOAD R0 0
        ADD R0 R0 1     // address 1
        COMPARE R0 5
        BRANCH -2 IF LT
    ";
    let mut system = load(source, 0, SystemConfig::default());
    let report = system.run_to_completion(0).unwrap();
    assert_eq!(5, system.registers.read(0));
    // LOAD, then five passes of the loop body
    assert_eq!(1 + 5 * 3, report.retired);
    // EQ, GTE and LTE from the final 5 vs 5 comparison
    assert_eq!(0b10_1001, system.registers.read(COND_REG));
}

#[test]
fn branch_not_taken_falls_through() {
    let source = "
        LOAD R0 9
        ADD R0 R0 1
        COMPARE R0 5
        BRANCH -2 IF LT
        LOAD R7 3
    ";
    let mut system = load(source, 0, SystemConfig::default());
    system.run_to_completion(0).unwrap();
    assert_eq!(10, system.registers.read(0));
    assert_eq!(3, system.registers.read(7));
}

#[test]
fn labels_resolve_to_relative_branches() {
    let source = "
        LOAD R0 0
        LOAD R1 0
    top:
        ADD R0 R0 2
        ADD R1 R1 1
        COMPARE R1 4
        BRANCH top IF LT
    ";
    let mut system = load(source, 300, SystemConfig::default());
    system.run_to_completion(300).unwrap();
    assert_eq!(8, system.registers.read(0));
}

#[test]
fn call_and_return() {
    let source = "
        CALL 3
        LOAD R2 7
        BRANCH 3
        LOAD R1 5
        RETURN
    ";
    let mut system = load(source, 0, SystemConfig::default());
    system.run_to_completion(0).unwrap();
    assert_eq!(5, system.registers.read(1));
    assert_eq!(7, system.registers.read(2));
    assert_eq!(1, system.registers.read(LINK_REG));
}

#[test]
fn serial_run_matches_pipelined_run() {
    let source = "
        LOAD R1 12
        LOAD R2 5
        SUBTRACT R3 R1 R2
        MULTIPLY R4 R3 R3
        SWAP R5 R1 R2
        LOAD R6 200
        STORE R6 R4
        LOAD R7 R6
        MODULO R8 R4 5
        NOT R9 R8
        XOR R10 R9 R1
        SETFLAG 3
    ";
    let mut pipelined = load(source, 0, SystemConfig::default());
    let fast = pipelined.run(0, true, MemoryMode::Cache, None).unwrap();
    let mut serial = load(source, 0, SystemConfig::default());
    let slow = serial.run(0, false, MemoryMode::Cache, None).unwrap();

    assert_eq!(pipelined.registers, serial.registers);
    assert_eq!(fast.retired, slow.retired);
    assert!(fast.cycles < slow.cycles);
    assert_eq!(0, slow.stalls);

    let registers = &pipelined.registers;
    assert_eq!(7, registers.read(3));
    assert_eq!(49, registers.read(4));
    assert_eq!(5, registers.read(5));
    assert_eq!(12, registers.read(2));
    assert_eq!(49, registers.read(7));
    assert_eq!(4, registers.read(8));
    assert_eq!(!4 ^ 12, registers.read(10));
    assert_ne!(0, registers.read(COND_REG) & 0b1000);
}

#[test]
fn division_by_zero_stops_the_run() {
    let mut system = load(
        "LOAD R1 0\nLOAD R2 8\nDIVIDE R0 R2 R1",
        0,
        SystemConfig::default(),
    );
    let (calls, on_complete) = counting_callback();
    let err = system
        .run(0, true, MemoryMode::Cache, Some(on_complete))
        .unwrap_err();
    assert!(err.to_string().contains("Division by zero"));
    assert_eq!(0, calls.get());
    assert!(!system.pipeline.is_running());
}

#[test]
fn reload_after_cycle_limit() {
    let mut config = SystemConfig::default();
    config.pipeline.max_cycles = 10;
    let mut system = load("BRANCH 0", 0, config);
    assert!(system.run(0, true, MemoryMode::Direct, None).is_err());
    assert_eq!(None, system.memory().pending());

    system.load_program(100, &assemble("LOAD R0 9")).unwrap();
    system.config.pipeline.max_cycles = 1_000;
    system.run(100, true, MemoryMode::Direct, None).unwrap();
    assert_eq!(9, system.registers.read(0));
}

#[test]
fn reload_after_fault() {
    let mut system = load(
        "LOAD R1 0\nLOAD R2 8\nDIVIDE R0 R2 R1",
        0,
        SystemConfig::default(),
    );
    assert!(system.run(0, true, MemoryMode::Cache, None).is_err());
    assert_eq!(None, system.memory().pending());

    system.load_program(0, &assemble("LOAD R0 4")).unwrap();
    system.run(0, true, MemoryMode::Cache, None).unwrap();
    assert_eq!(4, system.registers.read(0));
}

#[test]
fn vector_program() {
    let source = "
        LOAD R1 100
        LOAD R2 200
        LOAD V0 R1 4
        ADD V1 V0 V0 4
        MULTIPLY V2 V1 3 4
        STORE V2 R2 4
        APPEND V3 R1
        APPEND V3 R2
    ";
    let mut system = load(source, 0, SystemConfig::default());
    for offset in 0..4 {
        system
            .cache
            .main_memory_mut()
            .force_store(100 + offset, i32::try_from(offset).unwrap() + 1);
    }
    system.run_to_completion(0).unwrap();

    assert_eq!(
        &[Some(1), Some(2), Some(3), Some(4)],
        &system.vector_registers.get(0)[..4]
    );
    assert_eq!(None, system.vector_registers.get_slot(0, 4));
    assert_eq!(
        &[Some(6), Some(12), Some(18), Some(24)],
        &system.vector_registers.get(2)[..4]
    );
    for (offset, expected) in [6, 12, 18, 24].into_iter().enumerate() {
        assert_eq!(expected, system.peek(200 + offset));
    }
    assert_eq!(
        &[Some(100), Some(200), None],
        &system.vector_registers.get(3)[..3]
    );
}

#[test]
fn dereferenced_operands() {
    let source = "
        LOAD R1 50
        LOAD R4 51
        ADD R2 [R1] 4
        MULTIPLY R3 [R1] [R4]
        SUBTRACT R5 [R4] R2
    ";
    let mut system = load(source, 0, SystemConfig::default());
    system.cache.main_memory_mut().force_store(50, 6);
    system.cache.main_memory_mut().force_store(51, 7);
    system.run_to_completion(0).unwrap();
    assert_eq!(10, system.registers.read(2));
    assert_eq!(42, system.registers.read(3));
    assert_eq!(-3, system.registers.read(5));
}

#[test]
fn halt_only_program() {
    let mut system = System::new(SystemConfig::default()).unwrap();
    assert_eq!(1, system.load_program(0, &[]).unwrap());
    let (calls, on_complete) = counting_callback();
    let report = system
        .run(0, true, MemoryMode::Cache, Some(on_complete))
        .unwrap();
    assert_eq!(0, report.retired);
    assert_eq!(1, calls.get());
}

#[test]
fn invalid_words_are_skipped() {
    let mut words = assemble("LOAD R0 3");
    words.push(0x0B00_0000);
    words.extend(assemble("ADD R0 R0 1"));
    let mut system = System::new(SystemConfig::default()).unwrap();
    system.load_program(0, &words).unwrap();
    let report = system.run_to_completion(0).unwrap();
    assert_eq!(4, system.registers.read(0));
    assert_eq!(3, report.retired);
}

#[test]
fn direct_memory_without_wait_states() {
    let config = SystemConfig {
        memory: MemoryConfig {
            lines: 64,
            delay: 0,
        },
        ..SystemConfig::default()
    };
    let mut system = load("LOAD R0 7\nLOAD R1 20\nSTORE R1 R0", 0, config);
    system.run(0, true, MemoryMode::Direct, None).unwrap();
    assert_eq!(7, system.memory().peek(20));
    assert_eq!(0, system.cache.stats().hits + system.cache.stats().misses);
}

#[test]
fn cache_serves_sequential_fetches() {
    let mut system = load(
        "LOAD R0 1\nLOAD R1 2\nLOAD R2 3\nLOAD R3 4",
        0,
        SystemConfig::default(),
    );
    system.run_to_completion(0).unwrap();
    let stats = system.cache.stats();
    assert!(stats.hits > 0);
    assert!(stats.misses > 0);
    assert!(system.cache.lines().iter().any(|line| line.valid));
}

#[test]
fn write_allocate_keeps_store_in_cache() {
    let config = SystemConfig {
        cache: CacheConfig {
            lines: 16,
            write_allocate: true,
        },
        ..SystemConfig::default()
    };
    let mut system = load("LOAD R1 600\nLOAD R2 9\nSTORE R1 R2", 0, config);
    system.run_to_completion(0).unwrap();
    assert_eq!(9, system.peek(600));
    assert_eq!(0, system.memory().peek(600));

    system.cache.flush();
    assert_eq!(9, system.memory().peek(600));
}

#[test]
fn loader_writes_halt_after_program() {
    let mut system = System::new(SystemConfig::default()).unwrap();
    let words = assemble("LOAD R0 1");
    system.load_program(40, &words).unwrap();
    assert_eq!(word_from_raw(words[0]), system.memory().peek(40));
    assert_eq!(
        word_from_raw(vecpipe::instruction::instruction::HALT),
        system.memory().peek(41)
    );
}
