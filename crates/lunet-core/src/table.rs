//! Hybrid array+hash table.
//!
//! Elements live in two parts: an array part for non-negative integer keys
//! and a hash part for everything else. The array size is kept at the
//! largest `n` such that at least half the slots between 1 and `n` are in
//! use. The hash part is a chained scatter table with Brent's variation:
//! if an element is not in its main position (the slot its hash maps to),
//! then the colliding element is in its own main position, so chains stay
//! rooted at main positions and performance holds even at full load.

use crate::error::RuntimeError;
use crate::heap::{Arena, GcBox};
use crate::mem::Mem;
use crate::object::GcRef;
use crate::string::TString;
use crate::value::Value;
use std::mem::size_of;

/// Max size of the array part is 2^MAXBITS.
pub const MAXBITS: usize = 26;
pub const MAXASIZE: usize = 1 << MAXBITS;

/// A hash-part key slot.
///
/// `Free` marks a never-used node (the only kind `getfreepos` may claim).
/// `Dead` is the tombstone left when a weak table drops a collectable key:
/// it keeps the identity bits so `next` can still resolve the key and
/// collision chains stay traversable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NodeKey {
    Free,
    Live(Value),
    Dead(GcRef),
}

/// One slot of the hash part; chains link by physical index.
#[derive(Clone, Copy, Debug)]
pub struct Node {
    pub(crate) key: NodeKey,
    pub(crate) val: Value,
    pub(crate) next: Option<u32>,
}

const FREE_NODE: Node = Node {
    key: NodeKey::Free,
    val: Value::nil(),
    next: None,
};

/// Position of a value slot in either part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotPos {
    Array(usize),
    Node(usize),
}

pub struct Table {
    /// Bit `i` set means tag-method event `i` is known absent from this
    /// table's metatable.
    pub(crate) flags: u8,
    /// log2 of the hash part size.
    pub(crate) lsizenode: u8,
    pub(crate) metatable: Option<GcRef>,
    /// Array part: keys 1..=len at array[key-1]; nil encodes absence.
    pub(crate) array: Vec<Value>,
    /// Hash part; an empty vector stands in for the shared dummy node.
    pub(crate) node: Vec<Node>,
    /// High-water mark for free-slot search, scanned downward.
    pub(crate) lastfree: usize,
}

/// ceil(log2(x)) for x >= 1.
fn ceillog2(x: usize) -> usize {
    debug_assert!(x >= 1);
    (usize::BITS - (x - 1).leading_zeros()) as usize
}

/// Returns the index for `key` if it can live in the array part.
fn arrayindex(key: Value) -> Option<i64> {
    let n = key.as_number()?;
    let k = n as i64;
    if k as f64 == n {
        Some(k)
    } else {
        None
    }
}

/// Count an integer-valued key into its binary slice.
fn countint(key: Value, nums: &mut [usize; MAXBITS + 1]) -> usize {
    match arrayindex(key) {
        Some(k) if k > 0 && (k as usize) <= MAXASIZE => {
            nums[ceillog2(k as usize)] += 1;
            1
        }
        _ => 0,
    }
}

/// Compute the optimal array size: the largest power of two such that more
/// than half of the slots below it would be used. Updates `narray` to that
/// size and returns the number of integer keys that will go to the array.
fn computesizes(nums: &[usize; MAXBITS + 1], narray: &mut usize) -> usize {
    let mut a = 0; // number of elements smaller than 2^i
    let mut na = 0; // number of elements to go to array part
    let mut n = 0; // optimal size for array part
    let mut twotoi = 1usize;
    let mut i = 0;
    while twotoi / 2 < *narray && i <= MAXBITS {
        if nums[i] > 0 {
            a += nums[i];
            if a > twotoi / 2 {
                n = twotoi;
                na = a;
            }
        }
        if a == *narray {
            break; // all elements already counted
        }
        i += 1;
        twotoi *= 2;
    }
    *narray = n;
    debug_assert!(*narray / 2 <= na && na <= *narray);
    na
}

impl Table {
    /// Create a table presized for `narr` array slots and `nhash` hash
    /// slots.
    pub fn new(narr: usize, nhash: usize) -> Result<Table, RuntimeError> {
        if nhash > 0 && ceillog2(nhash) > MAXBITS {
            return Err(RuntimeError::TableOverflow);
        }
        let mut t = Table {
            flags: !0,
            lsizenode: 0,
            metatable: None,
            array: vec![Value::nil(); narr],
            node: Vec::new(),
            lastfree: 0,
        };
        t.setnodevector(nhash);
        Ok(t)
    }

    #[inline]
    pub(crate) fn sizenode(&self) -> usize {
        self.node.len()
    }

    /// Accounted size of this table's storage.
    pub fn bytes(&self) -> usize {
        size_of::<GcBox<Table>>()
            + self.array.len() * size_of::<Value>()
            + self.node.len() * size_of::<Node>()
    }

    pub fn metatable(&self) -> Option<GcRef> {
        self.metatable
    }

    // ---- Hashing ----

    /// Hash for numbers: fold the two halves of the double, then avoid
    /// modulus by a power of two (float bit patterns carry many 2 factors).
    /// +0 and -0 must land in the same slot.
    fn hashnum(&self, n: f64) -> usize {
        if n == 0.0 {
            return 0;
        }
        let bits = n.to_bits();
        let sum = (bits as u32).wrapping_add((bits >> 32) as u32);
        (sum as usize) % ((self.sizenode() - 1) | 1)
    }

    /// Hash for identity bits (light pointers and collectable references).
    fn hashid(&self, id: u64) -> usize {
        let sum = (id as u32).wrapping_add((id >> 32) as u32);
        (sum as usize) % ((self.sizenode() - 1) | 1)
    }

    /// The main position of a key: the slot its hash maps to before any
    /// collision displacement. The hash part must be non-empty.
    pub(crate) fn mainposition(&self, key: Value, strings: &Arena<TString>) -> usize {
        debug_assert!(!self.node.is_empty());
        if let Some(n) = key.as_number() {
            self.hashnum(n)
        } else if let Some(r) = key.as_obj() {
            if r.kind == crate::object::ObjKind::String {
                (strings.get(r.index).obj.hash() as usize) & (self.sizenode() - 1)
            } else {
                self.hashid(r.id_bits())
            }
        } else if let Some(b) = key.as_bool() {
            (b as usize) & (self.sizenode() - 1)
        } else if let Some(p) = key.as_light_ptr() {
            self.hashid(p as u64)
        } else {
            unreachable!("nil key has no main position")
        }
    }

    // ---- Lookup ----

    /// Find the slot holding `key`, if any. An array-range integer key
    /// always has a slot; a hash key has one only while a node holds it.
    fn find_slot(&self, key: Value, strings: &Arena<TString>) -> Option<SlotPos> {
        if key.is_nil() {
            return None;
        }
        if let Some(k) = arrayindex(key) {
            if k >= 1 && (k as usize) <= self.array.len() {
                return Some(SlotPos::Array(k as usize - 1));
            }
        }
        if self.node.is_empty() {
            return None;
        }
        let mut n = Some(self.mainposition(key, strings) as u32);
        while let Some(i) = n {
            let nd = &self.node[i as usize];
            if let NodeKey::Live(k2) = nd.key {
                if k2 == key {
                    return Some(SlotPos::Node(i as usize));
                }
            }
            n = nd.next;
        }
        None
    }

    /// Raw lookup. Nil keys yield nil.
    pub fn get(&self, key: Value, strings: &Arena<TString>) -> Value {
        match self.find_slot(key, strings) {
            Some(SlotPos::Array(i)) => self.array[i],
            Some(SlotPos::Node(i)) => self.node[i].val,
            None => Value::nil(),
        }
    }

    /// Specialized lookup for integer keys.
    pub fn get_int(&self, key: i64) -> Value {
        if key >= 1 && (key as usize) <= self.array.len() {
            return self.array[key as usize - 1];
        }
        if self.node.is_empty() {
            return Value::nil();
        }
        let nk = key as f64;
        let mut n = Some(self.hashnum(nk) as u32);
        while let Some(i) = n {
            let nd = &self.node[i as usize];
            if let NodeKey::Live(k) = nd.key {
                if k.as_number() == Some(nk) {
                    return nd.val;
                }
            }
            n = nd.next;
        }
        Value::nil()
    }

    /// Specialized lookup for string keys (identity comparison).
    pub fn get_str(&self, key: GcRef, strings: &Arena<TString>) -> Value {
        if self.node.is_empty() {
            return Value::nil();
        }
        let h = strings.get(key.index).obj.hash();
        let mut n = Some(((h as usize) & (self.sizenode() - 1)) as u32);
        while let Some(i) = n {
            let nd = &self.node[i as usize];
            if let NodeKey::Live(k) = nd.key {
                if k.as_obj() == Some(key) {
                    return nd.val;
                }
            }
            n = nd.next;
        }
        Value::nil()
    }

    // ---- Insertion ----

    fn slot_mut(&mut self, pos: SlotPos) -> &mut Value {
        match pos {
            SlotPos::Array(i) => &mut self.array[i],
            SlotPos::Node(i) => &mut self.node[i].val,
        }
    }

    fn put(&mut self, pos: SlotPos, v: Value) {
        *self.slot_mut(pos) = v;
    }

    /// Get-or-create the slot for `key`, returning a mutable reference.
    /// Clears the tag-method absence cache. Errors on nil and NaN keys.
    pub fn set(
        &mut self,
        key: Value,
        strings: &Arena<TString>,
        mem: &mut Mem,
    ) -> Result<&mut Value, RuntimeError> {
        self.flags = 0;
        let pos = self.set_slot(key, strings, mem)?;
        Ok(self.slot_mut(pos))
    }

    /// Specialized get-or-create for integer keys.
    pub fn set_int(
        &mut self,
        key: i64,
        strings: &Arena<TString>,
        mem: &mut Mem,
    ) -> Result<&mut Value, RuntimeError> {
        if key >= 1 && (key as usize) <= self.array.len() {
            return Ok(&mut self.array[key as usize - 1]);
        }
        let kv = Value::number(key as f64);
        let pos = match self.find_slot(kv, strings) {
            Some(p) => p,
            None => self.newkey(kv, strings, mem)?,
        };
        Ok(self.slot_mut(pos))
    }

    /// Specialized get-or-create for string keys.
    pub fn set_str(
        &mut self,
        key: GcRef,
        strings: &Arena<TString>,
        mem: &mut Mem,
    ) -> Result<&mut Value, RuntimeError> {
        let kv = Value::from_obj(key);
        let pos = match self.find_slot(kv, strings) {
            Some(p) => p,
            None => self.newkey(kv, strings, mem)?,
        };
        Ok(self.slot_mut(pos))
    }

    fn set_slot(
        &mut self,
        key: Value,
        strings: &Arena<TString>,
        mem: &mut Mem,
    ) -> Result<SlotPos, RuntimeError> {
        if let Some(pos) = self.find_slot(key, strings) {
            return Ok(pos);
        }
        if key.is_nil() {
            return Err(RuntimeError::NilIndex);
        }
        if key.as_number().map(f64::is_nan) == Some(true) {
            return Err(RuntimeError::NanIndex);
        }
        self.newkey(key, strings, mem)
    }

    /// Take a fresh slot from the top of the free space. Slots freed by
    /// weak clearing keep their (dead) keys and are never handed out again;
    /// once the scan hits bottom the table must be rehashed.
    fn getfreepos(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if matches!(self.node[self.lastfree].key, NodeKey::Free) {
                return Some(self.lastfree);
            }
        }
        None
    }

    /// Insert a new key into the hash part.
    ///
    /// If the key's main position is taken, check whether the colliding
    /// node is in its own main position: if not, move it to a free slot
    /// and claim the main position for the new key; otherwise the new key
    /// goes to a free slot chained after the incumbent.
    fn newkey(
        &mut self,
        key: Value,
        strings: &Arena<TString>,
        mem: &mut Mem,
    ) -> Result<SlotPos, RuntimeError> {
        if !self.node.is_empty() {
            let mp = self.mainposition(key, strings);
            if self.node[mp].val.is_nil() {
                // Main position free (possibly a dead or vacated key slot).
                self.node[mp].key = NodeKey::Live(key);
                debug_assert!(self.node[mp].val.is_nil());
                return Ok(SlotPos::Node(mp));
            }
            if let Some(n) = self.getfreepos() {
                let mpkey = match self.node[mp].key {
                    NodeKey::Live(k) => k,
                    // A non-nil value always sits under a live key.
                    _ => unreachable!("occupied node without live key"),
                };
                let othern = self.mainposition(mpkey, strings);
                if othern != mp {
                    // Colliding node is out of its main position: move it
                    // into the free slot and put the new key at `mp`.
                    let mut prev = othern;
                    while self.node[prev].next != Some(mp as u32) {
                        prev = self.node[prev].next.expect("broken collision chain") as usize;
                    }
                    self.node[prev].next = Some(n as u32);
                    self.node[n] = self.node[mp]; // copies the chain link too
                    self.node[mp].next = None;
                    self.node[mp].val = Value::nil();
                    self.node[mp].key = NodeKey::Live(key);
                    return Ok(SlotPos::Node(mp));
                } else {
                    // Colliding node is in its own main position: chain the
                    // new key from it.
                    self.node[n].next = self.node[mp].next;
                    self.node[mp].next = Some(n as u32);
                    self.node[n].key = NodeKey::Live(key);
                    debug_assert!(self.node[n].val.is_nil());
                    return Ok(SlotPos::Node(n));
                }
            }
        }
        // Hash part is dummy or out of free slots: grow and retry.
        self.rehash(key, strings, mem)?;
        self.set_slot(key, strings, mem)
    }

    // ---- Rehash ----

    fn numusearray(&self, nums: &mut [usize; MAXBITS + 1]) -> usize {
        let mut ause = 0;
        let mut i = 1usize; // count to traverse all array keys
        let mut ttlg = 1usize; // 2^lg
        for lg in 0..=MAXBITS {
            let mut lc = 0;
            let mut lim = ttlg;
            if lim > self.array.len() {
                lim = self.array.len();
                if i > lim {
                    break;
                }
            }
            // count elements in range (2^(lg-1), 2^lg]
            while i <= lim {
                if !self.array[i - 1].is_nil() {
                    lc += 1;
                }
                i += 1;
            }
            nums[lg] += lc;
            ause += lc;
            ttlg *= 2;
        }
        ause
    }

    fn numusehash(&self, nums: &mut [usize; MAXBITS + 1], pnasize: &mut usize) -> usize {
        let mut totaluse = 0;
        let mut ause = 0;
        for nd in &self.node {
            if !nd.val.is_nil() {
                if let NodeKey::Live(k) = nd.key {
                    ause += countint(k, nums);
                }
                totaluse += 1;
            }
        }
        *pnasize += ause;
        totaluse
    }

    fn setnodevector(&mut self, size: usize) {
        if size == 0 {
            self.node = Vec::new();
            self.lsizenode = 0;
            self.lastfree = 0;
        } else {
            let lsize = ceillog2(size);
            debug_assert!(lsize <= MAXBITS);
            let size = 1usize << lsize;
            self.node = vec![FREE_NODE; size];
            self.lsizenode = lsize as u8;
            self.lastfree = size; // all positions are free
        }
    }

    /// Resize both parts. Array keys falling out of a shrinking array part
    /// are re-inserted into the hash part; the old hash part is re-inserted
    /// wholesale.
    pub fn resize(
        &mut self,
        nasize: usize,
        nhsize: usize,
        strings: &Arena<TString>,
        mem: &mut Mem,
    ) -> Result<(), RuntimeError> {
        if nhsize > 0 && ceillog2(nhsize) > MAXBITS {
            return Err(RuntimeError::TableOverflow);
        }
        let old_bytes = self.bytes();
        let result = self.resize_parts(nasize, nhsize, strings, mem);
        mem.charge(old_bytes, self.bytes());
        result
    }

    fn resize_parts(
        &mut self,
        nasize: usize,
        nhsize: usize,
        strings: &Arena<TString>,
        mem: &mut Mem,
    ) -> Result<(), RuntimeError> {
        let oldasize = self.array.len();
        if nasize > oldasize {
            // array part must grow
            self.array.resize(nasize, Value::nil());
        }
        // create new hash part with appropriate size
        let oldnode = std::mem::take(&mut self.node);
        self.setnodevector(nhsize);
        if nasize < oldasize {
            // array part must shrink: re-insert the vanishing slice. The
            // tail is detached first so a nested rehash triggered by the
            // re-insertion cannot clobber values not yet moved.
            let tail = self.array.split_off(nasize);
            for (off, v) in tail.into_iter().enumerate() {
                if !v.is_nil() {
                    let slot = self.set_int((nasize + off + 1) as i64, strings, mem)?;
                    *slot = v;
                }
            }
        }
        // re-insert elements from the old hash part, last to first
        for nd in oldnode.iter().rev() {
            if !nd.val.is_nil() {
                let k = match nd.key {
                    NodeKey::Live(k) => k,
                    _ => unreachable!("occupied node without live key"),
                };
                let pos = self.set_slot(k, strings, mem)?;
                self.put(pos, nd.val);
            }
        }
        Ok(())
    }

    /// Host hint: resize the array part to exactly `nasize` slots.
    pub fn resize_array(
        &mut self,
        nasize: usize,
        strings: &Arena<TString>,
        mem: &mut Mem,
    ) -> Result<(), RuntimeError> {
        let nhsize = self.sizenode();
        self.resize(nasize, nhsize, strings, mem)
    }

    fn rehash(
        &mut self,
        extra_key: Value,
        strings: &Arena<TString>,
        mem: &mut Mem,
    ) -> Result<(), RuntimeError> {
        let mut nums = [0usize; MAXBITS + 1]; // nums[i] = #keys in (2^(i-1), 2^i]
        let mut nasize = self.numusearray(&mut nums); // count keys in array part
        let mut totaluse = nasize; // all those keys are integer keys
        totaluse += self.numusehash(&mut nums, &mut nasize); // count keys in hash part
        // count extra key
        nasize += countint(extra_key, &mut nums);
        totaluse += 1;
        // compute new size for array part
        let na = computesizes(&nums, &mut nasize);
        log::debug!(
            "rehash: array {} -> {}, hash {} -> {}",
            self.array.len(),
            nasize,
            self.sizenode(),
            totaluse - na
        );
        self.resize(nasize, totaluse - na, strings, mem)
    }

    // ---- Boundary search ----

    fn unbound_search(&self, j: usize) -> i64 {
        let mut i = j as u64; // i is zero or a present index
        let mut j = i + 1;
        // find i and j such that i is present and j is not
        while !self.get_int(j as i64).is_nil() {
            i = j;
            if j > (i32::MAX as u64) / 2 {
                // table was built with bad purposes: resort to linear search
                let mut k = 1i64;
                while !self.get_int(k).is_nil() {
                    k += 1;
                }
                return k - 1;
            }
            j *= 2;
        }
        // binary search between them
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_int(m as i64).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i as i64
    }

    /// Find a boundary: an index `b` where `t[b]` is non-nil and `t[b+1]`
    /// is nil (0 if `t[1]` is nil). On tables with nil holes any valid
    /// boundary may be returned.
    pub fn length(&self) -> i64 {
        let mut j = self.array.len();
        if j > 0 && self.array[j - 1].is_nil() {
            // there is a boundary in the array part: binary-search for it
            let mut i = 0usize;
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.array[m - 1].is_nil() {
                    j = m;
                } else {
                    i = m;
                }
            }
            return i as i64;
        }
        if self.node.is_empty() {
            return j as i64;
        }
        self.unbound_search(j)
    }

    // ---- Iteration ----

    /// Index of a key for traversal: array elements first, then hash nodes
    /// by physical position. -1 signals the start of a traversal.
    fn findindex(&self, key: Value, strings: &Arena<TString>) -> Result<i64, RuntimeError> {
        if key.is_nil() {
            return Ok(-1); // first iteration
        }
        if let Some(k) = arrayindex(key) {
            if k >= 1 && (k as usize) <= self.array.len() {
                return Ok(k - 1);
            }
        }
        if !self.node.is_empty() {
            // the key may be dead already, which is fine for `next`
            let mut n = Some(self.mainposition(key, strings) as u32);
            while let Some(i) = n {
                let nd = &self.node[i as usize];
                let found = match nd.key {
                    NodeKey::Live(k2) => k2 == key,
                    NodeKey::Dead(r) => key.as_obj() == Some(r),
                    NodeKey::Free => false,
                };
                if found {
                    // hash elements are numbered after array ones
                    return Ok(self.array.len() as i64 + i as i64);
                }
                n = nd.next;
            }
        }
        Err(RuntimeError::InvalidNext)
    }

    /// Advance a traversal: with a nil key, start one; otherwise yield the
    /// entry after `key`. Mutating the table invalidates a running
    /// traversal: entries may then be skipped or repeated, but the walk
    /// itself stays safe.
    pub fn next(
        &self,
        key: Value,
        strings: &Arena<TString>,
    ) -> Result<Option<(Value, Value)>, RuntimeError> {
        let mut i = self.findindex(key, strings)? + 1;
        // try first the array part
        while (i as usize) < self.array.len() {
            let v = self.array[i as usize];
            if !v.is_nil() {
                return Ok(Some((Value::number((i + 1) as f64), v)));
            }
            i += 1;
        }
        // then the hash part
        let mut i = i as usize - self.array.len();
        while i < self.node.len() {
            let nd = &self.node[i];
            if !nd.val.is_nil() {
                let k = match nd.key {
                    NodeKey::Live(k) => k,
                    _ => unreachable!("occupied node without live key"),
                };
                return Ok(Some((k, nd.val)));
            }
            i += 1;
        }
        Ok(None) // no more elements
    }

    // ---- Collector hooks ----

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.node
    }

    pub(crate) fn array_part(&self) -> &[Value] {
        &self.array
    }

    pub(crate) fn array_part_mut(&mut self) -> &mut [Value] {
        &mut self.array
    }

    pub(crate) fn node_mut(&mut self, i: usize) -> &mut Node {
        &mut self.node[i]
    }

    // ---- Debug introspection (for tests and invariant checks) ----

    /// Current capacity of the array part.
    pub fn array_capacity(&self) -> usize {
        self.array.len()
    }

    /// Current capacity of the hash part (0 while dummy).
    pub fn hash_capacity(&self) -> usize {
        self.node.len()
    }

    /// Main position of a key, if the hash part exists.
    pub fn main_position_of(&self, key: Value, strings: &Arena<TString>) -> Option<usize> {
        if self.node.is_empty() || key.is_nil() {
            None
        } else {
            Some(self.mainposition(key, strings))
        }
    }

    /// Key stored at a physical hash slot.
    pub fn node_key(&self, i: usize) -> NodeKey {
        self.node[i].key
    }

    /// Chain link of a physical hash slot.
    pub fn node_next(&self, i: usize) -> Option<u32> {
        self.node[i].next
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.node.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> (Arena<TString>, Mem) {
        (Arena::new(), Mem::new())
    }

    fn num(n: f64) -> Value {
        Value::number(n)
    }

    #[test]
    fn test_empty_table() {
        let (strings, _) = env();
        let t = Table::new(0, 0).unwrap();
        assert_eq!(t.array_capacity(), 0);
        assert_eq!(t.hash_capacity(), 0);
        assert!(t.get(num(1.0), &strings).is_nil());
        assert!(t.get(Value::nil(), &strings).is_nil());
        assert_eq!(t.length(), 0);
    }

    #[test]
    fn test_set_get_roundtrip() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        *t.set(num(1.0), &strings, &mut mem).unwrap() = num(10.0);
        *t.set(num(2.5), &strings, &mut mem).unwrap() = num(20.0);
        *t.set(Value::from_bool(true), &strings, &mut mem).unwrap() = num(30.0);
        assert_eq!(t.get(num(1.0), &strings), num(10.0));
        assert_eq!(t.get(num(2.5), &strings), num(20.0));
        assert_eq!(t.get(Value::from_bool(true), &strings), num(30.0));
        assert!(t.get(num(3.0), &strings).is_nil());
    }

    #[test]
    fn test_nil_key_errors() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        assert_eq!(
            t.set(Value::nil(), &strings, &mut mem).unwrap_err(),
            RuntimeError::NilIndex
        );
    }

    #[test]
    fn test_nan_key_errors() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        assert_eq!(
            t.set(num(f64::NAN), &strings, &mut mem).unwrap_err(),
            RuntimeError::NanIndex
        );
        // lookup with NaN is fine, it just finds nothing
        assert!(t.get(num(f64::NAN), &strings).is_nil());
    }

    #[test]
    fn test_existing_key_reuses_slot() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        *t.set(num(7.5), &strings, &mut mem).unwrap() = num(1.0);
        let cap = t.hash_capacity();
        // overwrite, including through a nil value (slot keeps its key)
        *t.set(num(7.5), &strings, &mut mem).unwrap() = Value::nil();
        *t.set(num(7.5), &strings, &mut mem).unwrap() = num(2.0);
        assert_eq!(t.hash_capacity(), cap);
        assert_eq!(t.get(num(7.5), &strings), num(2.0));
    }

    #[test]
    fn test_array_growth_powers_of_two() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        let mut last = 0;
        for i in 1..=100i64 {
            *t.set_int(i, &strings, &mut mem).unwrap() = num(i as f64);
            let cap = t.array_capacity();
            assert!(cap >= last, "array part never shrinks while appending");
            assert!(cap == 0 || cap.is_power_of_two());
            last = cap;
        }
        assert!(t.array_capacity() >= 100);
        for i in 1..=100i64 {
            assert_eq!(t.get_int(i), num(i as f64));
        }
    }

    #[test]
    fn test_negative_and_zero_keys_go_to_hash() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        *t.set_int(0, &strings, &mut mem).unwrap() = num(100.0);
        *t.set_int(-5, &strings, &mut mem).unwrap() = num(200.0);
        assert_eq!(t.array_capacity(), 0);
        assert_eq!(t.get_int(0), num(100.0));
        assert_eq!(t.get_int(-5), num(200.0));
    }

    #[test]
    fn test_zero_signs_share_slot() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 1).unwrap();
        *t.set(num(0.0), &strings, &mut mem).unwrap() = num(1.0);
        assert_eq!(t.get(num(-0.0), &strings), num(1.0));
        *t.set(num(-0.0), &strings, &mut mem).unwrap() = num(2.0);
        assert_eq!(t.get(num(0.0), &strings), num(2.0));
    }

    #[test]
    fn test_main_position_invariant() {
        // After arbitrary insertions, a node out of its main position must
        // be reachable from a chain anchored at its main position.
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        for i in 0..64i64 {
            *t.set(num(i as f64 + 0.5), &strings, &mut mem).unwrap() = num(i as f64);
        }
        for i in 0..t.hash_capacity() {
            if let NodeKey::Live(k) = t.node_key(i) {
                let mp = t.main_position_of(k, &strings).unwrap();
                if mp != i {
                    // walk the chain from mp; it must reach i
                    let mut cur = Some(mp as u32);
                    let mut reached = false;
                    while let Some(c) = cur {
                        if c as usize == i {
                            reached = true;
                            break;
                        }
                        cur = t.node_next(c as usize);
                    }
                    assert!(reached, "node {i} unreachable from its main position {mp}");
                    // and the occupant of mp must be at its own main position
                    if let NodeKey::Live(mk) = t.node_key(mp) {
                        assert_eq!(t.main_position_of(mk, &strings), Some(mp));
                    }
                }
            }
        }
    }

    #[test]
    fn test_length_boundaries() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        for i in 1..=10i64 {
            *t.set_int(i, &strings, &mut mem).unwrap() = num(i as f64);
        }
        assert_eq!(t.length(), 10);
        *t.set_int(10, &strings, &mut mem).unwrap() = Value::nil();
        let b = t.length();
        assert!(!t.get_int(b).is_nil() || b == 0);
        assert!(t.get_int(b + 1).is_nil());
    }

    #[test]
    fn test_length_hash_only() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        *t.set_int(0, &strings, &mut mem).unwrap() = num(0.0);
        assert_eq!(t.length(), 0);
    }

    #[test]
    fn test_iteration_yields_all_once() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        for i in 1..=5i64 {
            *t.set_int(i, &strings, &mut mem).unwrap() = num((i * 10) as f64);
        }
        *t.set(num(0.5), &strings, &mut mem).unwrap() = num(99.0);
        *t.set(Value::from_bool(false), &strings, &mut mem).unwrap() = num(98.0);

        let mut seen = Vec::new();
        let mut key = Value::nil();
        while let Some((k, v)) = t.next(key, &strings).unwrap() {
            seen.push((k, v));
            key = k;
        }
        assert_eq!(seen.len(), 7);
        // array part comes out in index order first
        for (i, (k, _)) in seen.iter().take(5).enumerate() {
            assert_eq!(*k, num((i + 1) as f64));
        }
    }

    #[test]
    fn test_next_invalid_key() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        *t.set_int(1, &strings, &mut mem).unwrap() = num(1.0);
        assert_eq!(
            t.next(num(42.5), &strings).unwrap_err(),
            RuntimeError::InvalidNext
        );
    }

    #[test]
    fn test_brent_relocation_with_light_ptrs() {
        // Pointer keys hash as folded identity mod ((size-1)|1). With hash
        // size 4 the modulus is 3, so pointers 3, 6, 9 all map to slot 0
        // and pointer 2 maps to slot 2.
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 4).unwrap();
        assert_eq!(t.hash_capacity(), 4);
        let k1 = Value::light_ptr(3);
        let k2 = Value::light_ptr(6);
        let k3 = Value::light_ptr(9);
        let k4 = Value::light_ptr(2);
        assert_eq!(t.main_position_of(k1, &strings), Some(0));
        *t.set(k1, &strings, &mut mem).unwrap() = num(1.0);
        *t.set(k2, &strings, &mut mem).unwrap() = num(2.0);
        *t.set(k3, &strings, &mut mem).unwrap() = num(3.0);
        // k3 was displaced into slot 2, which is k4's main position
        assert_eq!(t.main_position_of(k3, &strings), Some(0));
        assert_eq!(t.node_key(2), NodeKey::Live(k3));
        *t.set(k4, &strings, &mut mem).unwrap() = num(4.0);
        // no rehash happened and k4 claimed its main position
        assert_eq!(t.hash_capacity(), 4);
        assert_eq!(t.node_key(2), NodeKey::Live(k4));
        // every key still resolves
        assert_eq!(t.get(k1, &strings), num(1.0));
        assert_eq!(t.get(k2, &strings), num(2.0));
        assert_eq!(t.get(k3, &strings), num(3.0));
        assert_eq!(t.get(k4, &strings), num(4.0));
        // chains terminate
        for i in 0..4 {
            let mut steps = 0;
            let mut cur = Some(i as u32);
            while let Some(c) = cur {
                cur = t.node_next(c as usize);
                steps += 1;
                assert!(steps <= 4, "cycle in collision chain");
            }
        }
    }

    #[test]
    fn test_shrink_reinserts_tail() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        for i in 1..=16i64 {
            *t.set_int(i, &strings, &mut mem).unwrap() = num(i as f64);
        }
        t.resize_array(4, &strings, &mut mem).unwrap();
        for i in 1..=16i64 {
            assert_eq!(t.get_int(i), num(i as f64), "t[{i}] after shrink");
        }
        let b = t.length();
        assert!(b == 4 || b == 16, "boundary {b} not in {{4, 16}}");
    }

    #[test]
    fn test_mem_accounting_balances() {
        let (strings, mut mem) = env();
        let mut t = Table::new(0, 0).unwrap();
        let base = t.bytes();
        mem.alloc(base);
        for i in 1..=64i64 {
            *t.set_int(i, &strings, &mut mem).unwrap() = num(i as f64);
        }
        assert_eq!(mem.totalbytes, t.bytes());
    }

    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        SetInt(i64, f64),
        SetNum(f64, f64),
        DelInt(i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (-20i64..200, proptest::num::f64::NORMAL).prop_map(|(k, v)| Op::SetInt(k, v)),
            (proptest::num::f64::NORMAL, proptest::num::f64::NORMAL)
                .prop_map(|(k, v)| Op::SetNum(k, v)),
            (-20i64..200).prop_map(Op::DelInt),
        ]
    }

    proptest! {
        #[test]
        fn prop_table_matches_model(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            let (strings, mut mem) = env();
            let mut t = Table::new(0, 0).unwrap();
            let mut model: std::collections::HashMap<u64, f64> = Default::default();
            for op in &ops {
                match *op {
                    Op::SetInt(k, v) => {
                        *t.set_int(k, &strings, &mut mem).unwrap() = num(v);
                        model.insert(num(k as f64).raw_bits(), v);
                    }
                    Op::SetNum(k, v) => {
                        *t.set(num(k), &strings, &mut mem).unwrap() = num(v);
                        model.insert(num(k).raw_bits(), v);
                    }
                    Op::DelInt(k) => {
                        *t.set_int(k, &strings, &mut mem).unwrap() = Value::nil();
                        model.remove(&num(k as f64).raw_bits());
                    }
                }
            }
            // P1: lookups agree with the model
            for (kbits, v) in &model {
                let key = Value::number(f64::from_bits(*kbits));
                prop_assert_eq!(t.get(key, &strings), num(*v));
            }
            // P5: iteration yields each live entry exactly once
            let mut count = 0;
            let mut key = Value::nil();
            while let Some((k, v)) = t.next(key, &strings).unwrap() {
                let bits = k.raw_bits();
                prop_assert_eq!(model.get(&bits).copied(), v.as_number());
                count += 1;
                key = k;
            }
            prop_assert_eq!(count, model.len());
        }
    }
}
