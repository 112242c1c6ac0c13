use std::process;

use dbi_exec::callbacks::CallbackPosition;
use dbi_exec::config::EngineConfig;
use dbi_exec::vm::Vm;
use dbi_linux_user::{exec_ranges_from_self_maps, instruction_count, instruction_counter_callback, SelfMemoryReader};

/// Maps a small region of this process's own executable code and runs it
/// under the engine, counting instructions. This exists to exercise
/// `translate`/`run`/the broker end to end; it is deliberately small —
/// no `ptrace`-based entry-point hijacking of another process, which is
/// out of scope for this layer.
fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: dbi-trace <start-hex> <stop-hex>");
        process::exit(1);
    }

    let start = parse_hex(&args[1]);
    let stop = parse_hex(&args[2]);

    let mut vm = Vm::new(SelfMemoryReader, EngineConfig::default())
        .expect("failed to allocate the engine's code/data arenas");

    match exec_ranges_from_self_maps() {
        Ok(ranges) => vm.broker.add_instrumented_module(&ranges),
        Err(e) => {
            eprintln!("warning: failed to read /proc/self/maps: {e}");
        }
    }

    vm.callbacks
        .on_every_instruction(CallbackPosition::Pre, instruction_counter_callback);

    match vm.run(start, stop) {
        Ok(()) => {
            eprintln!("executed {} instructions", instruction_count());
        }
        Err(e) => {
            eprintln!("run failed: {e}");
            process::exit(1);
        }
    }
}

fn parse_hex(s: &str) -> u64 {
    let s = s.trim_start_matches("0x");
    u64::from_str_radix(s, 16).unwrap_or_else(|_| {
        eprintln!("invalid hex address: {s}");
        process::exit(1);
    })
}
