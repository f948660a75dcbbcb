use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

use cfg_if::cfg_if;
use static_assertions::const_assert;

use heaprc_system::sync::{Atom, PrimitiveAtom};

use super::side_table::SideTableEntry;

/// A contiguous bitfield of a refcount word
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Field {
    pub shift: u32,
    pub width: u32,
}
impl Field {
    /// A field which occupies no bits, and always reads as zero
    pub const NONE: Self = Self::new(0, 0);

    pub const fn new(shift: u32, width: u32) -> Self {
        Self { shift, width }
    }

    /// The largest value this field can hold
    #[inline(always)]
    pub const fn max(self) -> u64 {
        if self.width == 0 {
            0
        } else {
            u64::MAX >> (64 - self.width)
        }
    }

    #[inline(always)]
    pub const fn mask(self) -> u64 {
        self.max() << self.shift
    }

    /// The index of the first bit above this field
    #[inline(always)]
    pub const fn end(self) -> u32 {
        self.shift + self.width
    }

    #[inline(always)]
    const fn get(self, bits: u64) -> u64 {
        (bits & self.mask()) >> self.shift
    }

    #[inline(always)]
    const fn set(self, bits: u64, value: u64) -> u64 {
        (bits & !self.mask()) | ((value << self.shift) & self.mask())
    }
}

/// Describes where each field of a refcount word lives.
///
/// Every layout shares the same basic shape: `STRONG_EXTRA` sits directly beneath
/// `USE_SLOW_RC`, which is the sign bit of the word, so that a carry out of (or a
/// borrow into) the strong count is visible as the sign bit flipping. The fast paths
/// rely on this to detect overflow and the 1 -> 0 transition with a single test.
pub trait RefCountLayout: 'static {
    /// The primitive type the word is stored as in memory
    type Repr: PrimitiveAtom;

    /// Width of the stored word in bits
    const BITS: u32;
    const UNOWNED: Field;
    const IS_DEINITING: Field;
    /// The strong count minus one
    const STRONG_EXTRA: Field;
    const USE_SLOW_RC: Field;
    /// Together with `USE_SLOW_RC`, these bits are all set in an immortal word
    const IMMORTAL: Field;
    /// Holds the side table pointer, shifted right by `SIDE_TABLE_UNUSED_LOW_BITS`
    const SIDE_TABLE: Field;
    /// Set along with `USE_SLOW_RC` when the word holds a side table pointer.
    ///
    /// This bit overlaps `STRONG_EXTRA`, which means a strong decrement applied to a
    /// side table pointer stops borrowing here instead of clearing `USE_SLOW_RC`.
    const SIDE_TABLE_MARK: Field;
    const SIDE_TABLE_UNUSED_LOW_BITS: u32;

    fn pack(bits: u64) -> Self::Repr;
    fn unpack(raw: Self::Repr) -> u64;
}

/// The layout of the refcount word embedded in every object header
#[derive(Debug)]
pub enum InlineLayout {}

/// The layout of the refcount word stored in a [`SideTableEntry`]
#[derive(Debug)]
pub enum SideTableLayout {}

cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        mod inline_fields {
            use super::Field;

            // Bits 30 and 31 are reserved so that both side table fields are strictly wider
            pub const UNOWNED: Field = Field::new(0, 30);
            pub const IS_DEINITING: Field = Field::new(32, 1);
            pub const STRONG_EXTRA: Field = Field::new(33, 30);
            pub const USE_SLOW_RC: Field = Field::new(63, 1);
            pub const IMMORTAL: Field = Field::new(0, 32);
            pub const SIDE_TABLE: Field = Field::new(0, 62);
            pub const SIDE_TABLE_MARK: Field = Field::new(62, 1);
            pub const SIDE_TABLE_UNUSED_LOW_BITS: u32 = 3;
        }
    } else if #[cfg(target_pointer_width = "32")] {
        mod inline_fields {
            use super::Field;

            pub const UNOWNED: Field = Field::new(0, 8);
            pub const IS_DEINITING: Field = Field::new(8, 1);
            pub const STRONG_EXTRA: Field = Field::new(9, 22);
            pub const USE_SLOW_RC: Field = Field::new(31, 1);
            pub const IMMORTAL: Field = Field::new(0, 8);
            pub const SIDE_TABLE: Field = Field::new(0, 30);
            pub const SIDE_TABLE_MARK: Field = Field::new(30, 1);
            pub const SIDE_TABLE_UNUSED_LOW_BITS: u32 = 2;
        }
    } else {
        compile_error!("unsupported target pointer width");
    }
}

impl RefCountLayout for InlineLayout {
    type Repr = usize;

    const BITS: u32 = usize::BITS;
    const UNOWNED: Field = inline_fields::UNOWNED;
    const IS_DEINITING: Field = inline_fields::IS_DEINITING;
    const STRONG_EXTRA: Field = inline_fields::STRONG_EXTRA;
    const USE_SLOW_RC: Field = inline_fields::USE_SLOW_RC;
    const IMMORTAL: Field = inline_fields::IMMORTAL;
    const SIDE_TABLE: Field = inline_fields::SIDE_TABLE;
    const SIDE_TABLE_MARK: Field = inline_fields::SIDE_TABLE_MARK;
    const SIDE_TABLE_UNUSED_LOW_BITS: u32 = inline_fields::SIDE_TABLE_UNUSED_LOW_BITS;

    #[inline(always)]
    fn pack(bits: u64) -> usize {
        bits as usize
    }

    #[inline(always)]
    fn unpack(raw: usize) -> u64 {
        raw as u64
    }
}

impl RefCountLayout for SideTableLayout {
    type Repr = u64;

    const BITS: u32 = 64;
    const UNOWNED: Field = Field::new(0, 31);
    const IS_DEINITING: Field = Field::new(31, 1);
    const STRONG_EXTRA: Field = Field::new(32, 31);
    // Never set by a live count, this only absorbs carries and marks immortality
    const USE_SLOW_RC: Field = Field::new(63, 1);
    const IMMORTAL: Field = Field::new(0, 31);
    const SIDE_TABLE: Field = Field::NONE;
    const SIDE_TABLE_MARK: Field = Field::NONE;
    const SIDE_TABLE_UNUSED_LOW_BITS: u32 = 0;

    #[inline(always)]
    fn pack(bits: u64) -> u64 {
        bits
    }

    #[inline(always)]
    fn unpack(raw: u64) -> u64 {
        raw
    }
}

const_assert!(InlineLayout::STRONG_EXTRA.end() == InlineLayout::USE_SLOW_RC.shift);
const_assert!(InlineLayout::USE_SLOW_RC.end() == InlineLayout::BITS);
const_assert!(InlineLayout::SIDE_TABLE_MARK.shift >= InlineLayout::STRONG_EXTRA.shift);
const_assert!(InlineLayout::SIDE_TABLE_MARK.end() <= InlineLayout::USE_SLOW_RC.shift);
const_assert!(InlineLayout::SIDE_TABLE.end() <= InlineLayout::SIDE_TABLE_MARK.shift);
const_assert!(InlineLayout::IS_DEINITING.shift >= InlineLayout::IMMORTAL.end());
const_assert!(SideTableLayout::STRONG_EXTRA.end() == SideTableLayout::USE_SLOW_RC.shift);
const_assert!(SideTableLayout::USE_SLOW_RC.end() == SideTableLayout::BITS);
const_assert!(SideTableLayout::IS_DEINITING.shift >= SideTableLayout::IMMORTAL.end());
// Promotion must always make room
const_assert!(SideTableLayout::STRONG_EXTRA.width > InlineLayout::STRONG_EXTRA.width);
const_assert!(SideTableLayout::UNOWNED.width > InlineLayout::UNOWNED.width);

/// The refcount word stored inline in an object header
pub type InlineRefCountBits = RefCountBitsT<InlineLayout>;
/// The refcount word stored in a side table entry
pub type SideTableRefCountBits = RefCountBitsT<SideTableLayout>;

/// A decoded view of a refcount word
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RefCountState {
    Counts {
        strong_extra: u32,
        unowned: u32,
        is_deiniting: bool,
    },
    SideTable(NonNull<SideTableEntry>),
    Immortal,
}

/// A snapshot of a refcount word, packed according to `L`.
///
/// The word holds one of three things, see [`RefCountState`]: the counts themselves,
/// a pointer to the side table the counts were moved to, or the immortal pattern.
/// All mutation happens on local copies, which the engine then publishes with a
/// compare-and-swap.
#[repr(transparent)]
pub struct RefCountBitsT<L: RefCountLayout> {
    bits: u64,
    _layout: PhantomData<L>,
}
impl<L: RefCountLayout> Clone for RefCountBitsT<L> {
    #[inline(always)]
    fn clone(&self) -> Self {
        *self
    }
}
impl<L: RefCountLayout> Copy for RefCountBitsT<L> {}
impl<L: RefCountLayout> PartialEq for RefCountBitsT<L> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}
impl<L: RefCountLayout> Eq for RefCountBitsT<L> {}

impl<L: RefCountLayout> Atom for RefCountBitsT<L> {
    type Repr = L::Repr;

    #[inline(always)]
    fn pack(self) -> Self::Repr {
        L::pack(self.bits)
    }

    #[inline(always)]
    fn unpack(src: Self::Repr) -> Self {
        Self::from_raw(L::unpack(src))
    }
}

impl<L: RefCountLayout> RefCountBitsT<L> {
    const WORD_MASK: u64 = u64::MAX >> (64 - L::BITS);
    const USE_SLOW_RC_BIT: u64 = L::USE_SLOW_RC.mask();
    const SIDE_TABLE_BITS: u64 = L::USE_SLOW_RC.mask() | L::SIDE_TABLE_MARK.mask();
    const IMMORTAL_BITS: u64 = L::USE_SLOW_RC.mask() | L::IMMORTAL.mask();
    const IMMORTAL_CHECK_MASK: u64 = Self::IMMORTAL_BITS | L::SIDE_TABLE_MARK.mask();

    #[inline(always)]
    const fn from_raw(bits: u64) -> Self {
        Self {
            bits,
            _layout: PhantomData,
        }
    }

    /// Creates a word holding the given counts.
    ///
    /// A freshly allocated object starts out as `new(0, 1)`: one strong reference,
    /// plus the unowned reference held collectively by all strong references.
    pub const fn new(strong_extra_count: u32, unowned_count: u32) -> Self {
        let bits = L::UNOWNED.set(0, unowned_count as u64);
        Self::from_raw(L::STRONG_EXTRA.set(bits, strong_extra_count as u64))
    }

    pub const fn immortal() -> Self {
        Self::from_raw(Self::IMMORTAL_BITS)
    }

    /// The raw value of this word
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.bits
    }

    #[inline]
    pub fn state(&self) -> RefCountState {
        if let Some(side) = self.side_table() {
            RefCountState::SideTable(side)
        } else if self.is_immortal() {
            RefCountState::Immortal
        } else {
            RefCountState::Counts {
                strong_extra: self.strong_extra_count(),
                unowned: self.unowned_count(),
                is_deiniting: self.is_deiniting(),
            }
        }
    }

    /// True if this word is either immortal or refers to a side table
    #[inline(always)]
    pub fn uses_slow_rc(&self) -> bool {
        self.bits & Self::USE_SLOW_RC_BIT != 0
    }

    #[inline(always)]
    pub fn is_immortal(&self) -> bool {
        self.bits & Self::IMMORTAL_CHECK_MASK == Self::IMMORTAL_BITS
    }

    #[inline(always)]
    pub fn has_side_table(&self) -> bool {
        L::SIDE_TABLE_MARK.width != 0 && self.bits & Self::SIDE_TABLE_BITS == Self::SIDE_TABLE_BITS
    }

    #[inline]
    pub fn side_table(&self) -> Option<NonNull<SideTableEntry>> {
        if !self.has_side_table() {
            return None;
        }
        let addr = L::SIDE_TABLE.get(self.bits) << L::SIDE_TABLE_UNUSED_LOW_BITS;
        NonNull::new(addr as usize as *mut SideTableEntry)
    }

    #[inline]
    pub fn strong_extra_count(&self) -> u32 {
        debug_assert!(!self.has_side_table());
        L::STRONG_EXTRA.get(self.bits) as u32
    }

    #[inline]
    pub fn unowned_count(&self) -> u32 {
        debug_assert!(!self.has_side_table());
        L::UNOWNED.get(self.bits) as u32
    }

    #[inline]
    pub fn is_deiniting(&self) -> bool {
        debug_assert!(!self.has_side_table());
        L::IS_DEINITING.get(self.bits) != 0
    }

    #[inline]
    pub fn set_strong_extra_count(&mut self, count: u32) {
        debug_assert!(!self.has_side_table());
        debug_assert!(count as u64 <= L::STRONG_EXTRA.max());
        self.bits = L::STRONG_EXTRA.set(self.bits, count as u64);
    }

    #[inline]
    pub fn set_unowned_count(&mut self, count: u32) {
        debug_assert!(!self.has_side_table());
        debug_assert!(count as u64 <= L::UNOWNED.max());
        self.bits = L::UNOWNED.set(self.bits, count as u64);
    }

    #[inline]
    pub fn set_is_deiniting(&mut self, value: bool) {
        debug_assert!(!self.has_side_table());
        self.bits = L::IS_DEINITING.set(self.bits, value as u64);
    }

    /// Adds `inc` to the strong count.
    ///
    /// Returns false if the operation must take the slow path instead: the word is
    /// immortal or refers to a side table, or the field would overflow. The contents
    /// of `self` are unspecified when this returns false.
    #[must_use]
    #[inline(always)]
    pub fn increment_strong_extra_count(&mut self, inc: u32) -> bool {
        let inc = inc as u64;
        if self.uses_slow_rc() || inc > L::STRONG_EXTRA.max() {
            return false;
        }
        self.bits = self.bits.wrapping_add(inc << L::STRONG_EXTRA.shift) & Self::WORD_MASK;
        !self.uses_slow_rc()
    }

    /// Subtracts `dec` from the strong count.
    ///
    /// Returns false if the operation must take the slow path instead: the word is
    /// immortal or refers to a side table, or the strong count would drop to zero.
    /// The contents of `self` are unspecified when this returns false.
    #[must_use]
    #[inline(always)]
    pub fn decrement_strong_extra_count(&mut self, dec: u32) -> bool {
        let dec = dec as u64;
        if self.uses_slow_rc() || dec > L::STRONG_EXTRA.max() {
            return false;
        }
        self.bits = self.bits.wrapping_sub(dec << L::STRONG_EXTRA.shift) & Self::WORD_MASK;
        !self.uses_slow_rc()
    }

    /// Adds `inc` to the unowned count, returning false and leaving the word untouched
    /// if the field cannot represent the result.
    #[must_use]
    #[inline]
    pub fn increment_unowned_count(&mut self, inc: u32) -> bool {
        let count = self.unowned_count() as u64 + inc as u64;
        if count > L::UNOWNED.max() {
            return false;
        }
        self.bits = L::UNOWNED.set(self.bits, count);
        true
    }

    #[inline]
    pub fn decrement_unowned_count(&mut self, dec: u32) {
        let count = self.unowned_count();
        debug_assert!(
            count >= dec,
            "released unowned reference more times than it was retained"
        );
        self.bits = L::UNOWNED.set(self.bits, count.wrapping_sub(dec) as u64);
    }

    /// True if this word describes an object with exactly one strong reference
    #[inline]
    pub fn is_uniquely_referenced(&self) -> bool {
        !self.uses_slow_rc() && !self.is_deiniting() && self.strong_extra_count() == 0
    }
}

impl InlineRefCountBits {
    /// Creates a word referring to `side`
    pub fn from_side_table(side: NonNull<SideTableEntry>) -> Self {
        let addr = side.as_ptr() as usize as u64;
        let shifted = addr >> InlineLayout::SIDE_TABLE_UNUSED_LOW_BITS;
        debug_assert_eq!(shifted << InlineLayout::SIDE_TABLE_UNUSED_LOW_BITS, addr);
        debug_assert!(shifted <= InlineLayout::SIDE_TABLE.max());
        Self::from_raw(Self::SIDE_TABLE_BITS | InlineLayout::SIDE_TABLE.set(0, shifted))
    }
}

impl SideTableRefCountBits {
    /// Copies the counts of an inline word which is about to be replaced by a side table
    /// pointer. Immortality carries over as well.
    pub fn from_inline(inline: InlineRefCountBits) -> Self {
        debug_assert!(
            !inline.has_side_table(),
            "a side table refcount word cannot itself refer to a side table"
        );
        if inline.is_immortal() {
            return Self::immortal();
        }
        let mut bits = Self::new(inline.strong_extra_count(), inline.unowned_count());
        bits.set_is_deiniting(inline.is_deiniting());
        bits
    }
}

impl<L: RefCountLayout> fmt::Debug for RefCountBitsT<L> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.state() {
            RefCountState::Counts {
                strong_extra,
                unowned,
                is_deiniting,
            } => f
                .debug_struct("RefCountBits")
                .field("strong_extra", &strong_extra)
                .field("unowned", &unowned)
                .field("is_deiniting", &is_deiniting)
                .finish(),
            RefCountState::SideTable(side) => write!(f, "RefCountBits(side_table: {:p})", side),
            RefCountState::Immortal => f.write_str("RefCountBits(immortal)"),
        }
    }
}
