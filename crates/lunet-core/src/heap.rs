//! Arena-backed heap for collectable objects.
//!
//! Each object kind lives in its own arena of `GcBox` slots addressed by the
//! index half of a `GcRef`. The collector owns every slot; host references
//! are non-owning and must be rooted (registry or main stack) to stay valid
//! across collection steps.

use crate::error::RuntimeError;
use crate::object::{GcHeader, GcRef, ObjKind};
use crate::state::State;
use crate::string::TString;
use crate::table::Table;
use crate::value::Value;
use std::mem::size_of;

/// A collectable object together with its header.
pub struct GcBox<T> {
    pub hdr: GcHeader,
    pub obj: T,
}

/// A slotted arena with free-list reuse.
pub struct Arena<T> {
    slots: Vec<Option<GcBox<T>>>,
    free_slots: Vec<u32>,
}

impl<T> Arena<T> {
    pub fn new() -> Arena<T> {
        Arena {
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub fn alloc(&mut self, hdr: GcHeader, obj: T) -> u32 {
        let boxed = GcBox { hdr, obj };
        if let Some(idx) = self.free_slots.pop() {
            self.slots[idx as usize] = Some(boxed);
            idx
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Some(boxed));
            idx
        }
    }

    pub fn get(&self, idx: u32) -> &GcBox<T> {
        self.slots[idx as usize].as_ref().expect("object was freed")
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut GcBox<T> {
        self.slots[idx as usize].as_mut().expect("object was freed")
    }

    pub fn contains(&self, idx: u32) -> bool {
        self.slots
            .get(idx as usize)
            .map(Option::is_some)
            .unwrap_or(false)
    }

    pub fn free(&mut self, idx: u32) -> GcBox<T> {
        let boxed = self.slots[idx as usize].take().expect("object was freed");
        self.free_slots.push(idx);
        boxed
    }

    /// Iterate live slots.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &GcBox<T>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|b| (i as u32, b)))
    }

    /// Number of live objects.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Signature of host functions callable from the runtime (finalizers and
/// other native closures).
pub type NativeFn = fn(&mut State, &[Value]) -> Result<Vec<Value>, RuntimeError>;

/// A function closure: either bytecode (prototype + captured upvalues) or a
/// native host function.
pub enum Closure {
    Bytecode(BytecodeClosure),
    Native(NativeClosure),
}

pub struct BytecodeClosure {
    pub proto: GcRef,
    pub upvalues: Vec<GcRef>,
}

pub struct NativeClosure {
    pub func: NativeFn,
    pub name: &'static str,
}

impl Closure {
    pub fn bytes(&self) -> usize {
        let extra = match self {
            Closure::Bytecode(c) => c.upvalues.len() * size_of::<GcRef>(),
            Closure::Native(_) => 0,
        };
        size_of::<GcBox<Closure>>() + extra
    }
}

/// A host-defined blob with an optional metatable (`__gc` is honored by the
/// collector's finalize phase).
pub struct Userdata {
    pub data: Vec<u8>,
    pub metatable: Option<GcRef>,
}

impl Userdata {
    pub fn bytes(&self) -> usize {
        size_of::<GcBox<Userdata>>() + self.data.len()
    }
}

/// A cooperative coroutine context: its own value stack, scheduled
/// explicitly. The collector treats every live thread's stack as a root
/// frontier (threads are re-traversed at the atomic point and never stay
/// black, so stack writes need no barrier).
pub struct Thread {
    pub stack: Vec<Value>,
}

impl Thread {
    pub fn bytes(&self) -> usize {
        size_of::<GcBox<Thread>>() + self.stack.len() * size_of::<Value>()
    }
}

/// A function prototype: constant pool, inner prototypes, source name.
pub struct Proto {
    pub constants: Vec<Value>,
    pub protos: Vec<GcRef>,
    pub source: Option<GcRef>,
}

impl Proto {
    pub fn bytes(&self) -> usize {
        size_of::<GcBox<Proto>>()
            + self.constants.len() * size_of::<Value>()
            + self.protos.len() * size_of::<GcRef>()
    }
}

/// Where an upvalue's value lives.
#[derive(Clone, Copy)]
pub enum UpvalueSlot {
    /// Aliases a stack slot of a live thread.
    Open { thread: GcRef, slot: usize },
    /// Captured after the owning frame returned.
    Closed(Value),
}

pub struct Upvalue {
    pub v: UpvalueSlot,
}

impl Upvalue {
    pub fn bytes(&self) -> usize {
        size_of::<GcBox<Upvalue>>()
    }
}

pub fn string_bytes(s: &TString) -> usize {
    size_of::<GcBox<TString>>() + s.spilled()
}

/// All arenas, one per object kind.
pub struct Heap {
    pub strings: Arena<TString>,
    pub tables: Arena<Table>,
    pub closures: Arena<Closure>,
    pub udata: Arena<Userdata>,
    pub threads: Arena<Thread>,
    pub protos: Arena<Proto>,
    pub upvals: Arena<Upvalue>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            strings: Arena::new(),
            tables: Arena::new(),
            closures: Arena::new(),
            udata: Arena::new(),
            threads: Arena::new(),
            protos: Arena::new(),
            upvals: Arena::new(),
        }
    }

    pub fn header(&self, r: GcRef) -> &GcHeader {
        match r.kind {
            ObjKind::String => &self.strings.get(r.index).hdr,
            ObjKind::Table => &self.tables.get(r.index).hdr,
            ObjKind::Closure => &self.closures.get(r.index).hdr,
            ObjKind::Userdata => &self.udata.get(r.index).hdr,
            ObjKind::Thread => &self.threads.get(r.index).hdr,
            ObjKind::Proto => &self.protos.get(r.index).hdr,
            ObjKind::Upvalue => &self.upvals.get(r.index).hdr,
        }
    }

    pub fn header_mut(&mut self, r: GcRef) -> &mut GcHeader {
        match r.kind {
            ObjKind::String => &mut self.strings.get_mut(r.index).hdr,
            ObjKind::Table => &mut self.tables.get_mut(r.index).hdr,
            ObjKind::Closure => &mut self.closures.get_mut(r.index).hdr,
            ObjKind::Userdata => &mut self.udata.get_mut(r.index).hdr,
            ObjKind::Thread => &mut self.threads.get_mut(r.index).hdr,
            ObjKind::Proto => &mut self.protos.get_mut(r.index).hdr,
            ObjKind::Upvalue => &mut self.upvals.get_mut(r.index).hdr,
        }
    }

    pub fn contains(&self, r: GcRef) -> bool {
        match r.kind {
            ObjKind::String => self.strings.contains(r.index),
            ObjKind::Table => self.tables.contains(r.index),
            ObjKind::Closure => self.closures.contains(r.index),
            ObjKind::Userdata => self.udata.contains(r.index),
            ObjKind::Thread => self.threads.contains(r.index),
            ObjKind::Proto => self.protos.contains(r.index),
            ObjKind::Upvalue => self.upvals.contains(r.index),
        }
    }

    /// Total live objects across all arenas.
    pub fn live_objects(&self) -> usize {
        self.strings.live()
            + self.tables.live()
            + self.closures.live()
            + self.udata.live()
            + self.threads.live()
            + self.protos.live()
            + self.upvals.live()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
