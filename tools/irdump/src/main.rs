//! patchdump — decode → patch dump tool.
//!
//! Reads a raw byte file (no ELF parsing — a flat dump of the bytes you
//! want patched), decodes it instruction by instruction starting at a
//! given address, and prints the patch each instruction would receive
//! without ever writing to an executable arena.

use std::env;
use std::fs;
use std::process;

use dbi_asm::disassemble;
use dbi_backend::generate_patch;

struct Args {
    bin_path: String,
    start: u64,
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: patchdump <bin-file> <start-addr-hex>");
        process::exit(1);
    }
    let start = u64::from_str_radix(args[2].trim_start_matches("0x"), 16).unwrap_or_else(|_| {
        eprintln!("invalid start address: {}", args[2]);
        process::exit(1);
    });
    Args {
        bin_path: args[1].clone(),
        start,
    }
}

fn main() {
    let args = parse_args();
    let code = fs::read(&args.bin_path).unwrap_or_else(|e| {
        eprintln!("failed to read {}: {e}", args.bin_path);
        process::exit(1);
    });

    let metas = dbi_asm::decode_block(&code, args.start).unwrap_or_else(|e| {
        eprintln!("decode failed: {e}");
        process::exit(1);
    });

    for meta in metas {
        let disasm = disassemble(&meta.inst);
        let addr = meta.address;
        let patch = generate_patch(meta);
        println!(
            "{addr:#010x}  {disasm:<32}  -> {} relocatable insts, modify_pc={}",
            patch.insts.len(),
            patch.metadata.modify_pc
        );
    }
}
