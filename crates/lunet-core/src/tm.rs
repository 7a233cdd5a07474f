//! Tag methods (metamethod events) and their absence cache.
//!
//! Event names are interned once at state birth and fixed so the collector
//! never frees them. A table's `flags` byte caches "event known absent from
//! this table" for the events with fast access, so the common no-metamethod
//! case costs one bit test.

use crate::object::{GcRef, ObjKind};
use crate::state::State;
use crate::value::{type_index, Value};

/// Metamethod events, in lookup-order. Events up to `Eq` are cached in
/// table flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Tm {
    Index = 0,
    NewIndex,
    Gc,
    Mode,
    Eq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Len,
    Lt,
    Le,
    Concat,
    Call,
}

pub const TM_COUNT: usize = 17;

impl Tm {
    pub const ALL: [Tm; TM_COUNT] = [
        Tm::Index,
        Tm::NewIndex,
        Tm::Gc,
        Tm::Mode,
        Tm::Eq,
        Tm::Add,
        Tm::Sub,
        Tm::Mul,
        Tm::Div,
        Tm::Mod,
        Tm::Pow,
        Tm::Unm,
        Tm::Len,
        Tm::Lt,
        Tm::Le,
        Tm::Concat,
        Tm::Call,
    ];

    /// The event-name string.
    pub fn name(self) -> &'static [u8] {
        match self {
            Tm::Index => b"__index",
            Tm::NewIndex => b"__newindex",
            Tm::Gc => b"__gc",
            Tm::Mode => b"__mode",
            Tm::Eq => b"__eq",
            Tm::Add => b"__add",
            Tm::Sub => b"__sub",
            Tm::Mul => b"__mul",
            Tm::Div => b"__div",
            Tm::Mod => b"__mod",
            Tm::Pow => b"__pow",
            Tm::Unm => b"__unm",
            Tm::Len => b"__len",
            Tm::Lt => b"__lt",
            Tm::Le => b"__le",
            Tm::Concat => b"__concat",
            Tm::Call => b"__call",
        }
    }

    /// Whether absence of this event is cached in table flags.
    #[inline]
    pub fn cacheable(self) -> bool {
        self <= Tm::Eq
    }
}

impl State {
    /// Intern and pin every event name.
    pub(crate) fn init_tm(&mut self) {
        for e in Tm::ALL {
            let s = self.new_string(e.name());
            self.fix_string(s); // never collect these names
            self.tmname[e as usize] = s.as_obj().expect("string value");
        }
    }

    /// Cached metamethod lookup, optimized for absence: a recorded miss
    /// costs one bit test until the table is next written through `set`.
    pub(crate) fn fasttm(&mut self, events: GcRef, e: Tm) -> Value {
        debug_assert!(e.cacheable());
        let flags = self.heap.tables.get(events.index).obj.flags;
        if flags & (1u8 << e as u8) != 0 {
            return Value::nil(); // cached miss
        }
        let name = self.tmname[e as usize];
        let v = self
            .heap
            .tables
            .get(events.index)
            .obj
            .get_str(name, &self.heap.strings);
        if v.is_nil() {
            // cache this fact
            self.heap.tables.get_mut(events.index).obj.flags |= 1u8 << e as u8;
        }
        v
    }

    /// Look up an event in a metatable value (nil when absent).
    pub fn get_tm(&mut self, events: Value, e: Tm) -> Value {
        let Some(r) = events.as_obj_of(ObjKind::Table) else {
            return Value::nil();
        };
        if e.cacheable() {
            self.fasttm(r, e)
        } else {
            let name = self.tmname[e as usize];
            self.heap
                .tables
                .get(r.index)
                .obj
                .get_str(name, &self.heap.strings)
        }
    }

    /// Resolve an event for a value, through its own metatable (tables and
    /// userdata) or the per-type default metatable.
    pub fn get_tm_by_obj(&self, o: Value, e: Tm) -> Value {
        let mt = match o.as_obj() {
            Some(r) if r.kind == ObjKind::Table => self.heap.tables.get(r.index).obj.metatable(),
            Some(r) if r.kind == ObjKind::Userdata => self.heap.udata.get(r.index).obj.metatable,
            _ => self.mt[type_index(o)],
        };
        match mt {
            Some(m) => {
                let name = self.tmname[e as usize];
                self.heap
                    .tables
                    .get(m.index)
                    .obj
                    .get_str(name, &self.heap.strings)
            }
            None => Value::nil(),
        }
    }
}
