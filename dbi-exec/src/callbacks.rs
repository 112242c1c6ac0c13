//! Minimal instrumentation API surface: register a callback to run
//! before/after a given address (or every address, or every basic
//! block), matching the external "instrumentation API" collaborator
//! named in the interface design without pulling in a scripting layer —
//! callbacks are plain Rust closures, not a bytecode VM.

use std::collections::HashMap;

use dbi_core::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackPosition {
    Pre,
    Post,
}

pub type InstCallback = fn(&mut Context, u64);

#[derive(Default)]
pub struct CallbackRegistry {
    per_address: HashMap<(u64, CallbackPosition), Vec<InstCallback>>,
    global: Vec<(CallbackPosition, InstCallback)>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_address(&mut self, addr: u64, pos: CallbackPosition, cb: InstCallback) {
        self.per_address.entry((addr, pos)).or_default().push(cb);
    }

    pub fn on_every_instruction(&mut self, pos: CallbackPosition, cb: InstCallback) {
        self.global.push((pos, cb));
    }

    pub fn fire(&self, pos: CallbackPosition, ctx: &mut Context, addr: u64) {
        if let Some(cbs) = self.per_address.get(&(addr, pos)) {
            for cb in cbs {
                cb(ctx, addr);
            }
        }
        for (p, cb) in &self.global {
            if *p == pos {
                cb(ctx, addr);
            }
        }
    }

    pub fn has_any_for(&self, addr: u64) -> bool {
        !self.global.is_empty()
            || self.per_address.contains_key(&(addr, CallbackPosition::Pre))
            || self.per_address.contains_key(&(addr, CallbackPosition::Post))
    }
}
