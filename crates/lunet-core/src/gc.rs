//! Incremental tri-color mark-and-sweep collector.
//!
//! Collection advances through pause → propagate → sweep-string → sweep →
//! finalize. Marking is incremental: each step darkens one gray object.
//! The atomic remark catches everything the mutator changed behind the
//! marker's back (backward-barrier regreys, thread stacks, weak tables),
//! separates finalizable userdata, and flips the current white. Two whites
//! alternate per cycle so objects born during a sweep are distinguishable
//! from doomed ones; only the previous cycle's white is dead.

use crate::heap::{string_bytes, Closure, UpvalueSlot};
use crate::object::{other_white, sweep_alive, GcRef, Marks, ObjKind};
use crate::state::State;
use crate::string::MIN_STRTAB_SIZE;
use crate::table::NodeKey;
use crate::tm::Tm;
use crate::value::{Value, NUM_TYPES};
use std::collections::VecDeque;

/// Step granularity in bytes.
pub const GCSTEPSIZE: usize = 1024;
/// Objects swept from the all-objects list per step.
const GCSWEEPMAX: usize = 40;
/// Cost (in step-work units) of sweeping one string bucket or one object.
const GCSWEEPCOST: isize = 10;
/// Cost of running one finalizer.
const GCFINALIZECOST: isize = 100;

/// Phases of a collection cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcPhase {
    Pause,
    Propagate,
    SweepString,
    Sweep,
    Finalize,
}

/// Cursor into the all-objects list, positioned so the link to the current
/// object can be rewritten when it is freed.
#[derive(Clone, Copy, Debug)]
pub enum SweepPos {
    Head,
    After(GcRef),
}

/// Collector bookkeeping owned by the runtime state.
pub struct GcState {
    pub phase: GcPhase,
    /// Carries one white bit plus FIXED, permanently: the derived deadmask
    /// then always contains FIXED, so fixed objects never test dead.
    pub currentwhite: Marks,
    /// Primary worklist of gray objects.
    pub gray: Vec<GcRef>,
    /// Black objects regreyed by the backward barrier; rescanned at atomic
    /// time.
    pub grayagain: Vec<GcRef>,
    /// Weak tables found during propagation; cleared at atomic time.
    pub weak: Vec<GcRef>,
    /// Head of the all-objects list (strings live in the intern table).
    pub rootgc: Option<GcRef>,
    pub sweep_pos: SweepPos,
    /// Next intern bucket to sweep.
    pub sweepstr: usize,
    /// Userdata awaiting finalization, in separation order.
    pub tmudata: VecDeque<GcRef>,
    /// Next step trigger for `check_gc`.
    pub threshold: usize,
    /// Pause between cycles, percent of live estimate (200 = wait for 2x).
    pub pause: usize,
    /// Step multiplier, percent (work per KB of allocation).
    pub step_mul: usize,
    /// Estimated live bytes after the last mark.
    pub estimate: usize,
    /// Allocation debt carried between steps.
    pub dept: isize,
}

impl GcState {
    pub fn new() -> GcState {
        GcState {
            phase: GcPhase::Pause,
            currentwhite: Marks::WHITE0 | Marks::FIXED,
            gray: Vec::new(),
            grayagain: Vec::new(),
            weak: Vec::new(),
            rootgc: None,
            sweep_pos: SweepPos::Head,
            sweepstr: 0,
            tmudata: VecDeque::new(),
            threshold: 4096,
            pause: 200,
            step_mul: 200,
            estimate: 0,
            dept: 0,
        }
    }

    /// The white painted on newly created objects.
    #[inline]
    pub fn white(&self) -> Marks {
        self.currentwhite & Marks::WHITES
    }

    /// The dead mask for sweeps (previous white, plus FIXED).
    #[inline]
    pub fn deadmask(&self) -> Marks {
        other_white(self.currentwhite)
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}

fn is_cleared_weak(heap: &crate::heap::Heap, v: Value, is_key: bool) -> bool {
    let Some(r) = v.as_obj() else { return false };
    if r.kind == ObjKind::String {
        return false; // strings are values, never weak
    }
    let h = heap.header(r);
    h.is_white()
        || (!is_key && r.kind == ObjKind::Userdata && h.marked.contains(Marks::FINALIZED))
}

impl State {
    /// Link a fresh collectable onto the all-objects list.
    pub(crate) fn link_object(&mut self, r: GcRef) {
        let head = self.gc.rootgc;
        self.heap.header_mut(r).next = head;
        self.gc.rootgc = Some(r);
    }

    // ---- Marking ----

    pub(crate) fn mark_value(&mut self, v: Value) {
        if let Some(r) = v.as_obj() {
            self.mark_object(r);
        }
    }

    pub(crate) fn mark_object(&mut self, r: GcRef) {
        {
            let h = self.heap.header_mut(r);
            if !h.is_white() {
                return;
            }
            h.white_to_gray();
        }
        match r.kind {
            // Strings carry no references; colorless is enough to survive.
            ObjKind::String => {}
            ObjKind::Userdata => {
                // Userdata are never gray: mark the metatable and blacken.
                let mt = self.heap.udata.get(r.index).obj.metatable;
                self.heap.header_mut(r).gray_to_black();
                if let Some(mt) = mt {
                    self.mark_object(mt);
                }
            }
            ObjKind::Upvalue => {
                // A closed upvalue blackens with its value marked; an open
                // one stays gray and pins the thread whose stack it aliases.
                enum Seen {
                    Closed(Value),
                    Open(GcRef),
                }
                let seen = match self.heap.upvals.get(r.index).obj.v {
                    UpvalueSlot::Closed(v) => Seen::Closed(v),
                    UpvalueSlot::Open { thread, .. } => Seen::Open(thread),
                };
                match seen {
                    Seen::Closed(v) => {
                        self.heap.header_mut(r).gray_to_black();
                        self.mark_value(v);
                    }
                    Seen::Open(th) => self.mark_object(th),
                }
            }
            _ => self.gc.gray.push(r),
        }
    }

    fn mark_mt(&mut self) {
        for i in 0..NUM_TYPES {
            if let Some(m) = self.mt[i] {
                self.mark_object(m);
            }
        }
    }

    /// Start a new cycle: mark the root set and enter propagation.
    pub(crate) fn mark_root(&mut self) {
        log::trace!("gc: mark roots");
        self.gc.gray.clear();
        self.gc.grayagain.clear();
        self.gc.weak.clear();
        self.mark_object(self.main);
        // make the globals table be traversed before the main stack
        self.mark_object(self.globals);
        self.mark_object(self.registry);
        self.mark_mt();
        self.gc.phase = GcPhase::Propagate;
    }

    // ---- Propagation ----

    /// Darken one gray object, graying its referents. Returns work done in
    /// traversed bytes.
    pub(crate) fn propagate_mark(&mut self) -> isize {
        let Some(r) = self.gc.gray.pop() else { return 0 };
        self.heap.header_mut(r).gray_to_black();
        match r.kind {
            ObjKind::Table => {
                let work = self.heap.tables.get(r.index).obj.bytes() as isize;
                if self.traverse_table(r) {
                    // weak tables stay gray until cleared
                    self.heap.header_mut(r).black_to_gray();
                }
                work
            }
            ObjKind::Closure => {
                let work = self.heap.closures.get(r.index).obj.bytes() as isize;
                self.traverse_closure(r);
                work
            }
            ObjKind::Thread => {
                // Threads are re-traversed at atomic time and never stay
                // black, so stack writes need no barrier.
                self.heap.header_mut(r).black_to_gray();
                self.gc.grayagain.push(r);
                let work = self.heap.threads.get(r.index).obj.bytes() as isize;
                self.traverse_thread(r);
                work
            }
            ObjKind::Proto => {
                let work = self.heap.protos.get(r.index).obj.bytes() as isize;
                self.traverse_proto(r);
                work
            }
            _ => unreachable!("leaf object on gray list"),
        }
    }

    fn propagate_all(&mut self) -> isize {
        let mut work = 0;
        while !self.gc.gray.is_empty() {
            work += self.propagate_mark();
        }
        work
    }

    /// Traverse a table's contents; returns true when the table is weak
    /// (and therefore must stay gray and be cleared at atomic time).
    fn traverse_table(&mut self, r: GcRef) -> bool {
        let mt = self.heap.tables.get(r.index).obj.metatable;
        if let Some(mt) = mt {
            self.mark_object(mt);
        }
        let mut weakkey = false;
        let mut weakvalue = false;
        if let Some(mt) = mt {
            let mode = self.fasttm(mt, Tm::Mode);
            if let Some(ms) = mode.as_obj_of(ObjKind::String) {
                let bytes = self.heap.strings.get(ms.index).obj.as_bytes();
                weakkey = bytes.contains(&b'k');
                weakvalue = bytes.contains(&b'v');
            }
        }
        if weakkey || weakvalue {
            let h = self.heap.header_mut(r);
            h.marked.remove(Marks::KEYWEAK | Marks::VALUEWEAK);
            if weakkey {
                h.marked.insert(Marks::KEYWEAK);
            }
            if weakvalue {
                h.marked.insert(Marks::VALUEWEAK);
            }
            // must be cleared after the mark phase
            self.gc.weak.push(r);
        }
        if weakkey && weakvalue {
            return true; // nothing left to propagate through it
        }
        let mut children: Vec<Value> = Vec::new();
        let mut tombstones: Vec<usize> = Vec::new();
        {
            let t = &self.heap.tables.get(r.index).obj;
            if !weakvalue {
                for &v in t.array_part() {
                    if v.is_collectable() {
                        children.push(v);
                    }
                }
            }
            for (i, nd) in t.nodes().iter().enumerate() {
                if nd.val.is_nil() {
                    // entry was erased: tombstone collectable keys
                    if let NodeKey::Live(k) = nd.key {
                        if k.is_collectable() {
                            tombstones.push(i);
                        }
                    }
                } else {
                    if let NodeKey::Live(k) = nd.key {
                        if !weakkey && k.is_collectable() {
                            children.push(k);
                        }
                    }
                    if !weakvalue && nd.val.is_collectable() {
                        children.push(nd.val);
                    }
                }
            }
        }
        for i in tombstones {
            let nd = self.heap.tables.get_mut(r.index).obj.node_mut(i);
            if let NodeKey::Live(k) = nd.key {
                nd.key = NodeKey::Dead(k.as_obj().expect("collectable key"));
            }
        }
        for c in children {
            self.mark_value(c);
        }
        weakkey || weakvalue
    }

    fn traverse_closure(&mut self, r: GcRef) {
        let (proto, upvals) = match &self.heap.closures.get(r.index).obj {
            Closure::Bytecode(c) => (Some(c.proto), c.upvalues.clone()),
            Closure::Native(_) => (None, Vec::new()),
        };
        if let Some(p) = proto {
            self.mark_object(p);
        }
        for uv in upvals {
            self.mark_object(uv);
        }
    }

    fn traverse_proto(&mut self, r: GcRef) {
        let (constants, inner, source) = {
            let p = &self.heap.protos.get(r.index).obj;
            (p.constants.clone(), p.protos.clone(), p.source)
        };
        if let Some(s) = source {
            self.mark_object(s);
        }
        for c in constants {
            self.mark_value(c);
        }
        for p in inner {
            self.mark_object(p);
        }
    }

    fn traverse_thread(&mut self, r: GcRef) {
        let stack = self.heap.threads.get(r.index).obj.stack.clone();
        for v in stack {
            self.mark_value(v);
        }
    }

    // ---- Atomic remark ----

    fn atomic(&mut self) {
        log::trace!("gc: atomic remark");
        self.propagate_all();
        // remark weak tables
        let w = std::mem::take(&mut self.gc.weak);
        self.gc.gray.extend(w);
        debug_assert!(!self.heap.header(self.main).is_white());
        self.mark_object(self.main);
        self.mark_object(self.globals);
        self.mark_object(self.registry);
        self.mark_mt();
        self.propagate_all();
        // remark objects caught by the backward barrier
        let ga = std::mem::take(&mut self.gc.grayagain);
        self.gc.gray.extend(ga);
        self.propagate_all();
        // separate userdata to be finalized, then keep them alive for the
        // finalize phase
        let udsize = self.separate_udata(false);
        self.mark_tmudata();
        self.propagate_all();
        // remove collected objects from weak tables
        self.clear_weak_tables();
        // flip current white
        self.gc.currentwhite = other_white(self.gc.currentwhite);
        self.gc.sweepstr = 0;
        self.gc.sweep_pos = SweepPos::Head;
        self.gc.phase = GcPhase::SweepString;
        self.gc.estimate = self.mem.totalbytes.saturating_sub(udsize);
    }

    /// Queue unreachable userdata that still need their `__gc` to run.
    /// Returns the byte size of what was separated.
    pub(crate) fn separate_udata(&mut self, all: bool) -> usize {
        let mut deadmem = 0;
        let candidates: Vec<u32> = self.heap.udata.iter().map(|(i, _)| i).collect();
        for i in candidates {
            let r = GcRef {
                kind: ObjKind::Userdata,
                index: i,
            };
            let (is_white, finalized) = {
                let h = self.heap.header(r);
                (h.is_white(), h.marked.contains(Marks::FINALIZED))
            };
            if (!is_white && !all) || finalized {
                continue; // reachable, or already handled
            }
            let mt = self.heap.udata.get(i).obj.metatable;
            let has_gc = match mt {
                Some(m) => !self.fasttm(m, Tm::Gc).is_nil(),
                None => false,
            };
            self.heap.header_mut(r).marked.insert(Marks::FINALIZED);
            if has_gc {
                deadmem += self.heap.udata.get(i).obj.bytes();
                self.gc.tmudata.push_back(r);
            }
        }
        deadmem
    }

    /// Mark everything on the finalization queue so it survives the coming
    /// sweep (resurrection until its `__gc` has run).
    fn mark_tmudata(&mut self) {
        let queued: Vec<GcRef> = self.gc.tmudata.iter().copied().collect();
        for r in queued {
            self.mark_object(r);
        }
    }

    /// Clear entries of weak tables whose weak key or value died this
    /// cycle. Dropped collectable keys become tombstones so collision
    /// chains and iteration stay intact.
    fn clear_weak_tables(&mut self) {
        let weak_list = self.gc.weak.clone();
        for t in weak_list {
            let (kweak, vweak) = {
                let m = self.heap.header(t).marked;
                (
                    m.contains(Marks::KEYWEAK),
                    m.contains(Marks::VALUEWEAK),
                )
            };
            // strings referenced from weak slots are kept (they are values)
            let mut strings_seen: Vec<GcRef> = Vec::new();
            let mut arr_clear: Vec<usize> = Vec::new();
            let mut node_clear: Vec<usize> = Vec::new();
            {
                let tb = &self.heap.tables.get(t.index).obj;
                for (i, &v) in tb.array_part().iter().enumerate() {
                    if let Some(s) = v.as_obj_of(ObjKind::String) {
                        strings_seen.push(s);
                    } else if vweak && !v.is_nil() && is_cleared_weak(&self.heap, v, false) {
                        arr_clear.push(i);
                    }
                }
                for (i, nd) in tb.nodes().iter().enumerate() {
                    if nd.val.is_nil() {
                        continue;
                    }
                    if let Some(s) = nd.val.as_obj_of(ObjKind::String) {
                        strings_seen.push(s);
                    }
                    let mut gone = false;
                    if let NodeKey::Live(k) = nd.key {
                        if let Some(s) = k.as_obj_of(ObjKind::String) {
                            strings_seen.push(s);
                        } else if kweak && is_cleared_weak(&self.heap, k, true) {
                            gone = true;
                        }
                    }
                    if vweak && is_cleared_weak(&self.heap, nd.val, false) {
                        gone = true;
                    }
                    if gone {
                        node_clear.push(i);
                    }
                }
            }
            for s in strings_seen {
                self.heap.header_mut(s).white_to_gray();
            }
            for i in arr_clear {
                self.heap.tables.get_mut(t.index).obj.array_part_mut()[i] = Value::nil();
            }
            for i in node_clear {
                let nd = self.heap.tables.get_mut(t.index).obj.node_mut(i);
                nd.val = Value::nil();
                if let NodeKey::Live(k) = nd.key {
                    if let Some(r) = k.as_obj() {
                        nd.key = NodeKey::Dead(r);
                    }
                }
            }
        }
    }

    // ---- Sweeping ----

    fn sweep_string_step(&mut self) -> isize {
        let old = self.mem.totalbytes;
        let i = self.gc.sweepstr;
        self.gc.sweepstr += 1;
        let deadmask = self.gc.deadmask();
        let white = self.gc.white();
        let bucket = std::mem::take(&mut self.strtab.buckets[i]);
        let mut kept = Vec::with_capacity(bucket.len());
        for id in bucket {
            if sweep_alive(self.heap.strings.get(id).hdr.marked, deadmask) {
                self.heap.strings.get_mut(id).hdr.make_white(white);
                kept.push(id);
            } else {
                let b = self.heap.strings.free(id);
                self.mem.free(string_bytes(&b.obj));
                self.strtab.nuse -= 1;
            }
        }
        self.strtab.buckets[i] = kept;
        if self.gc.sweepstr >= self.strtab.size() {
            log::trace!("gc: string sweep done, {} strings live", self.strtab.nuse);
            self.gc.phase = GcPhase::Sweep;
        }
        let freed = old - self.mem.totalbytes;
        self.gc.estimate = self.gc.estimate.saturating_sub(freed);
        GCSWEEPCOST
    }

    /// Sweep up to `limit` objects from the all-objects list. Returns true
    /// when the end of the list was reached.
    fn sweep_list(&mut self, limit: usize) -> bool {
        let deadmask = self.gc.deadmask();
        let white = self.gc.white();
        let mut count = limit;
        while count > 0 {
            let cur = match self.gc.sweep_pos {
                SweepPos::Head => self.gc.rootgc,
                SweepPos::After(p) => self.heap.header(p).next,
            };
            let Some(cur) = cur else { return true };
            count -= 1;
            let alive = sweep_alive(self.heap.header(cur).marked, deadmask);
            if alive {
                self.heap.header_mut(cur).make_white(white);
                self.gc.sweep_pos = SweepPos::After(cur);
            } else {
                let next = self.heap.header(cur).next;
                match self.gc.sweep_pos {
                    SweepPos::Head => self.gc.rootgc = next,
                    SweepPos::After(p) => self.heap.header_mut(p).next = next,
                }
                self.free_object(cur);
            }
        }
        let at_end = match self.gc.sweep_pos {
            SweepPos::Head => self.gc.rootgc,
            SweepPos::After(p) => self.heap.header(p).next,
        };
        at_end.is_none()
    }

    fn sweep_step(&mut self) -> isize {
        let old = self.mem.totalbytes;
        if self.sweep_list(GCSWEEPMAX) {
            self.shrink_string_table();
            log::trace!("gc: sweep done");
            self.gc.phase = GcPhase::Finalize;
        }
        let freed = old - self.mem.totalbytes;
        self.gc.estimate = self.gc.estimate.saturating_sub(freed);
        (GCSWEEPMAX as isize) * GCSWEEPCOST
    }

    fn free_object(&mut self, r: GcRef) {
        let bytes = match r.kind {
            ObjKind::Table => self.heap.tables.free(r.index).obj.bytes(),
            ObjKind::Closure => self.heap.closures.free(r.index).obj.bytes(),
            ObjKind::Userdata => self.heap.udata.free(r.index).obj.bytes(),
            ObjKind::Thread => self.heap.threads.free(r.index).obj.bytes(),
            ObjKind::Proto => self.heap.protos.free(r.index).obj.bytes(),
            ObjKind::Upvalue => self.heap.upvals.free(r.index).obj.bytes(),
            ObjKind::String => unreachable!("strings are swept through the intern table"),
        };
        self.mem.free(bytes);
    }

    /// Shrink the string table when occupancy drops far enough.
    fn shrink_string_table(&mut self) {
        let size = self.strtab.size();
        if (self.strtab.nuse as usize) < size / 4 && size > MIN_STRTAB_SIZE * 2 {
            let newsize = size / 2;
            log::trace!("gc: shrinking string table to {newsize} buckets");
            let strings = &self.heap.strings;
            self.strtab
                .rehash_into(newsize, |id| strings.get(id).obj.hash());
        }
    }

    // ---- Finalization ----

    /// Run one queued `__gc` finalizer. The userdata is repainted white and
    /// left on the main list: it survives this cycle and dies in a later
    /// one if still unreachable.
    fn gctm(&mut self) {
        let Some(r) = self.gc.tmudata.pop_front() else { return };
        let white = self.gc.white();
        self.heap.header_mut(r).make_white(white);
        let Some(mt) = self.heap.udata.get(r.index).obj.metatable else {
            return;
        };
        let tm = self.fasttm(mt, Tm::Gc);
        let Some(cr) = tm.as_obj_of(ObjKind::Closure) else { return };
        let native = match &self.heap.closures.get(cr.index).obj {
            Closure::Native(nc) => Some((nc.func, nc.name)),
            Closure::Bytecode(_) => None,
        };
        match native {
            Some((func, name)) => {
                let udval = Value::from_obj(r);
                // keep nested allocation from re-entering the collector
                let old_threshold = self.gc.threshold;
                self.gc.threshold = 2 * self.mem.totalbytes;
                if let Err(e) = func(self, &[udval]) {
                    log::warn!("error in __gc finalizer '{name}': {e}");
                }
                self.gc.threshold = old_threshold;
            }
            None => {
                log::debug!("skipping bytecode __gc finalizer (no interpreter in core)");
            }
        }
    }

    /// Run every pending finalizer (state shutdown path).
    pub fn finalize_all(&mut self) {
        while !self.gc.tmudata.is_empty() {
            self.gctm();
        }
    }

    // ---- Write barriers ----

    /// Forward barrier: on `p.field <- v` where `p` is black and `v` is
    /// white, darken `v` so `p` may stay black. Used for scalar fields
    /// (upvalues, userdata metatables).
    pub(crate) fn barrier(&mut self, p: GcRef, v: Value) {
        let Some(vr) = v.as_obj() else { return };
        if self.heap.header(vr).is_white() && self.heap.header(p).is_black() {
            if self.gc.phase == GcPhase::Propagate {
                log::trace!("gc: forward barrier {:?} -> {:?}", p, vr);
                self.mark_object(vr);
            } else {
                // during sweep it is enough to make `p` collectable-white
                let white = self.gc.white();
                self.heap.header_mut(p).make_white(white);
            }
        }
    }

    /// Backward barrier: on a table slot write that would blacken-break the
    /// invariant, regrey the table instead (cheaper for containers mutated
    /// many times). Rescanned at atomic time via `grayagain`.
    pub(crate) fn barrier_back(&mut self, t: GcRef, v: Value) {
        let Some(vr) = v.as_obj() else { return };
        if self.heap.header(vr).is_white() && self.heap.header(t).is_black() {
            log::trace!("gc: backward barrier regreys {:?}", t);
            self.heap.header_mut(t).black_to_gray();
            self.gc.grayagain.push(t);
        }
    }

    // ---- Driver ----

    /// Run one state-machine transition. Returns the work performed, in
    /// step-work units.
    pub fn gc_single_step(&mut self) -> isize {
        match self.gc.phase {
            GcPhase::Pause => {
                self.mark_root(); // start a new collection
                0
            }
            GcPhase::Propagate => {
                if !self.gc.gray.is_empty() {
                    self.propagate_mark()
                } else {
                    self.atomic(); // finish mark phase
                    0
                }
            }
            GcPhase::SweepString => self.sweep_string_step(),
            GcPhase::Sweep => self.sweep_step(),
            GcPhase::Finalize => {
                if !self.gc.tmudata.is_empty() {
                    self.gctm();
                    self.gc.estimate = self.gc.estimate.saturating_sub(GCFINALIZECOST as usize);
                    GCFINALIZECOST
                } else {
                    log::trace!("gc: cycle complete, estimate {} bytes", self.gc.estimate);
                    self.gc.phase = GcPhase::Pause;
                    self.gc.dept = 0;
                    0
                }
            }
        }
    }

    /// Run one bounded increment of collection work, scaled by the step
    /// multiplier, and advance the threshold.
    pub fn gc_step(&mut self) {
        let mut lim = ((GCSTEPSIZE / 100) * self.gc.step_mul) as isize;
        if lim == 0 {
            lim = isize::MAX / 2; // no limit
        }
        self.gc.dept += self.mem.totalbytes as isize - self.gc.threshold as isize;
        loop {
            lim -= self.gc_single_step();
            if self.gc.phase == GcPhase::Pause || lim <= 0 {
                break;
            }
        }
        if self.gc.phase != GcPhase::Pause {
            if self.gc.dept < GCSTEPSIZE as isize {
                self.gc.threshold = self.mem.totalbytes + GCSTEPSIZE;
            } else {
                self.gc.dept -= GCSTEPSIZE as isize;
                self.gc.threshold = self.mem.totalbytes;
            }
        } else {
            self.set_pause_threshold();
        }
    }

    /// Drive the collector through a complete cycle synchronously.
    pub fn full_gc(&mut self) {
        if matches!(self.gc.phase, GcPhase::Pause | GcPhase::Propagate) {
            // reset sweep marks to sweep all elements (returning them to
            // white); an interrupted propagation is abandoned
            self.gc.sweepstr = 0;
            self.gc.sweep_pos = SweepPos::Head;
            self.gc.gray.clear();
            self.gc.grayagain.clear();
            self.gc.weak.clear();
            self.gc.phase = GcPhase::SweepString;
        }
        // finish any pending sweep phase
        while self.gc.phase != GcPhase::Finalize {
            debug_assert!(matches!(
                self.gc.phase,
                GcPhase::SweepString | GcPhase::Sweep
            ));
            self.gc_single_step();
        }
        self.mark_root();
        while self.gc.phase != GcPhase::Pause {
            self.gc_single_step();
        }
        self.set_pause_threshold();
        log::debug!(
            "gc: full collection done, {} bytes accounted",
            self.mem.totalbytes
        );
    }

    /// Allocation hook: run a step when accounted bytes pass the threshold.
    /// Hosts call this at points where every live value is rooted.
    pub fn check_gc(&mut self) {
        if self.mem.totalbytes >= self.gc.threshold {
            self.gc_step();
        }
    }

    pub fn set_threshold(&mut self, bytes: usize) {
        self.gc.threshold = bytes;
    }

    pub fn set_pause(&mut self, pause: usize) {
        self.gc.pause = pause;
    }

    pub fn set_step_mul(&mut self, step_mul: usize) {
        self.gc.step_mul = step_mul;
    }

    fn set_pause_threshold(&mut self) {
        self.gc.threshold = (self.gc.estimate / 100) * self.gc.pause;
    }

    // ---- Introspection and invariant checks ----

    pub fn gc_is_white(&self, v: Value) -> bool {
        v.as_obj().map(|r| self.heap.header(r).is_white()).unwrap_or(false)
    }

    pub fn gc_is_black(&self, v: Value) -> bool {
        v.as_obj().map(|r| self.heap.header(r).is_black()).unwrap_or(false)
    }

    pub fn gc_is_gray(&self, v: Value) -> bool {
        v.as_obj().map(|r| self.heap.header(r).is_gray()).unwrap_or(false)
    }

    fn all_refs(&self) -> Vec<GcRef> {
        let mut refs = Vec::new();
        for (i, _) in self.heap.strings.iter() {
            refs.push(GcRef { kind: ObjKind::String, index: i });
        }
        for (i, _) in self.heap.tables.iter() {
            refs.push(GcRef { kind: ObjKind::Table, index: i });
        }
        for (i, _) in self.heap.closures.iter() {
            refs.push(GcRef { kind: ObjKind::Closure, index: i });
        }
        for (i, _) in self.heap.udata.iter() {
            refs.push(GcRef { kind: ObjKind::Userdata, index: i });
        }
        for (i, _) in self.heap.threads.iter() {
            refs.push(GcRef { kind: ObjKind::Thread, index: i });
        }
        for (i, _) in self.heap.protos.iter() {
            refs.push(GcRef { kind: ObjKind::Proto, index: i });
        }
        for (i, _) in self.heap.upvals.iter() {
            refs.push(GcRef { kind: ObjKind::Upvalue, index: i });
        }
        refs
    }

    fn children_of(&self, r: GcRef) -> Vec<Value> {
        let mut out = Vec::new();
        match r.kind {
            ObjKind::String => {}
            ObjKind::Table => {
                let t = &self.heap.tables.get(r.index).obj;
                if let Some(mt) = t.metatable() {
                    out.push(Value::from_obj(mt));
                }
                for &v in t.array_part() {
                    out.push(v);
                }
                for nd in t.nodes() {
                    if !nd.val.is_nil() {
                        if let NodeKey::Live(k) = nd.key {
                            out.push(k);
                        }
                        out.push(nd.val);
                    }
                }
            }
            ObjKind::Closure => match &self.heap.closures.get(r.index).obj {
                Closure::Bytecode(c) => {
                    out.push(Value::from_obj(c.proto));
                    out.extend(c.upvalues.iter().map(|&u| Value::from_obj(u)));
                }
                Closure::Native(_) => {}
            },
            ObjKind::Userdata => {
                if let Some(mt) = self.heap.udata.get(r.index).obj.metatable {
                    out.push(Value::from_obj(mt));
                }
            }
            ObjKind::Thread => {
                out.extend(self.heap.threads.get(r.index).obj.stack.iter().copied());
            }
            ObjKind::Proto => {
                let p = &self.heap.protos.get(r.index).obj;
                out.extend(p.constants.iter().copied());
                out.extend(p.protos.iter().map(|&ip| Value::from_obj(ip)));
                if let Some(s) = p.source {
                    out.push(Value::from_obj(s));
                }
            }
            ObjKind::Upvalue => {
                if let UpvalueSlot::Closed(v) = self.heap.upvals.get(r.index).obj.v {
                    out.push(v);
                }
            }
        }
        out
    }

    /// Tri-color invariant check (valid at step boundaries): no black
    /// object references an object the current cycle could still free.
    /// Before the white flip that is any white object; during the sweep
    /// phases survivors are repainted to the new white, so only the old
    /// white is a violation.
    pub fn check_color_invariants(&self) {
        let sweeping = matches!(
            self.gc.phase,
            GcPhase::SweepString | GcPhase::Sweep | GcPhase::Finalize
        );
        for r in self.all_refs() {
            if !self.heap.header(r).is_black() {
                continue;
            }
            for c in self.children_of(r) {
                if let Some(cr) = c.as_obj() {
                    let ch = self.heap.header(cr);
                    let doomed = if sweeping {
                        ch.is_dead(self.gc.currentwhite)
                    } else {
                        ch.is_white()
                    };
                    assert!(!doomed, "black {r:?} references doomed {cr:?}");
                }
            }
        }
    }

    /// Post-collection check: every live object carries the current white.
    pub fn check_all_current_white(&self) {
        let white = self.gc.white();
        for r in self.all_refs() {
            let h = self.heap.header(r);
            assert_eq!(
                h.marked & Marks::WHITES,
                white,
                "{r:?} carries a stale color: {:?}",
                h.marked
            );
        }
    }
}
