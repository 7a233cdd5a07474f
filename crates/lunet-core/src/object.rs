//! GC object headers, kinds, and mark bits.

use bitflags::bitflags;
use std::fmt;

/// The kind of a collectable object. Doubles as the arena selector.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjKind {
    String = 0,
    Table = 1,
    Closure = 2,
    Userdata = 3,
    Thread = 4,
    Proto = 5,
    Upvalue = 6,
}

impl ObjKind {
    /// Convert from the 3-bit kind field of a value payload.
    pub fn from_bits(bits: u64) -> Option<ObjKind> {
        match bits {
            0 => Some(ObjKind::String),
            1 => Some(ObjKind::Table),
            2 => Some(ObjKind::Closure),
            3 => Some(ObjKind::Userdata),
            4 => Some(ObjKind::Thread),
            5 => Some(ObjKind::Proto),
            6 => Some(ObjKind::Upvalue),
            _ => None,
        }
    }
}

/// A reference to a collectable object: kind + index into that kind's arena.
///
/// This is the runtime's "object pointer"; identity comparison of two refs
/// is object identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef {
    pub kind: ObjKind,
    pub index: u32,
}

impl GcRef {
    /// Identity bits, the hash input for reference-keyed table slots.
    #[inline]
    pub fn id_bits(self) -> u64 {
        ((self.kind as u64) << 32) | self.index as u64
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(#{})", self.kind, self.index)
    }
}

bitflags! {
    /// Layout of the `marked` byte.
    ///
    /// Bit 3 is shared: FINALIZED on userdata, KEYWEAK on tables.
    /// Exactly one of the two white bits is "current"; the other white is
    /// the dead color of the previous cycle.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Marks: u8 {
        const WHITE0     = 0b0000_0001;
        const WHITE1     = 0b0000_0010;
        const BLACK      = 0b0000_0100;
        const FINALIZED  = 0b0000_1000;
        const KEYWEAK    = 0b0000_1000;
        const VALUEWEAK  = 0b0001_0000;
        const FIXED      = 0b0010_0000;
        const SUPERFIXED = 0b0100_0000;

        const WHITES = 0b0000_0011;
    }
}

/// Bits preserved by `make_white` (everything but the color bits).
const MASKMARKS: u8 = !(Marks::BLACK.bits() | Marks::WHITES.bits());

/// Common header carried by every collectable object.
///
/// `next` threads the object onto the global all-objects list (strings use
/// their intern bucket instead and leave it `None`).
#[derive(Clone, Copy, Debug)]
pub struct GcHeader {
    pub next: Option<GcRef>,
    pub kind: ObjKind,
    pub marked: Marks,
}

impl GcHeader {
    pub fn new(kind: ObjKind, white: Marks) -> GcHeader {
        GcHeader {
            next: None,
            kind,
            marked: white,
        }
    }

    #[inline]
    pub fn is_white(&self) -> bool {
        self.marked.intersects(Marks::WHITES)
    }

    #[inline]
    pub fn is_black(&self) -> bool {
        self.marked.contains(Marks::BLACK)
    }

    #[inline]
    pub fn is_gray(&self) -> bool {
        !self.is_black() && !self.is_white()
    }

    #[inline]
    pub fn white_to_gray(&mut self) {
        self.marked.remove(Marks::WHITES);
    }

    #[inline]
    pub fn gray_to_black(&mut self) {
        self.marked.insert(Marks::BLACK);
    }

    #[inline]
    pub fn black_to_gray(&mut self) {
        self.marked.remove(Marks::BLACK);
    }

    /// Flip which white this object carries.
    #[inline]
    pub fn change_white(&mut self) {
        self.marked.toggle(Marks::WHITES);
    }

    /// Repaint to the given current white, keeping the non-color bits.
    #[inline]
    pub fn make_white(&mut self, current: Marks) {
        self.marked = Marks::from_bits_retain(
            (self.marked.bits() & MASKMARKS) | (current & Marks::WHITES).bits(),
        );
    }

    /// Dead test: carries the other (previous-cycle) white.
    #[inline]
    pub fn is_dead(&self, current: Marks) -> bool {
        !(self.marked & other_white(current) & Marks::WHITES).is_empty()
    }
}

/// The white of the previous cycle, derived from the current-white byte.
///
/// The current-white byte permanently carries FIXED (set at state birth), so
/// this mask contains FIXED too and fixed objects always pass the sweep
/// alive-test.
#[inline]
pub fn other_white(current: Marks) -> Marks {
    current ^ Marks::WHITES
}

/// Sweep alive-test: true when the object does not carry the dead white.
#[inline]
pub fn sweep_alive(marked: Marks, deadmask: Marks) -> bool {
    (marked.bits() ^ Marks::WHITES.bits()) & deadmask.bits() != 0
}
