/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! The capability slot (§3 Capability slot).
//!
//! Packed the way the teacher packs `UntypedCap`/`CapDerivationNode`: a
//! `register_bitfields!` layout read through a `LocalRegisterCopy`. One
//! slot is 128 bits — small enough to copy by value, which is what
//! `CAP_COPY`/weakening do.

use core::fmt;
use register::{register_bitfields, LocalRegisterCopy};

register_bitfields! {
    u128,
    CapSlotBits [
        Type OFFSET(0) NUMBITS(4) [
            Void = 0,
            Page = 1,
            RPage = 2,
            CapPage = 3,
            RCapPage = 4,
            Folio = 5,
            Activity = 6,
            ActivityControl = 7,
            Thread = 8,
            Messenger = 9,
            RMessenger = 10
        ],
        Discardable OFFSET(4) NUMBITS(1) [],
        /// Signed 7-bit priority, stored as its bit pattern (see
        /// [`CapSlot::priority`]/[`CapSlot::set_priority`]).
        PriorityBits OFFSET(5) NUMBITS(7) [],
        Guard OFFSET(12) NUMBITS(22) [],
        GuardBits OFFSET(34) NUMBITS(5) [],
        SubpageIndex OFFSET(39) NUMBITS(8) [],
        /// `log2` of `subpage_count`; the count itself is always a power
        /// of two (§3 Capability slot).
        SubpageCountLog2 OFFSET(47) NUMBITS(4) [],
        Oid OFFSET(51) NUMBITS(54) [],
        Version OFFSET(105) NUMBITS(20) []
    ]
}

/// The type tag of a capability slot (§3). `r*` variants are the
/// weakened, read-only forms; weakening is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapType {
    Void,
    Page,
    RPage,
    CapPage,
    RCapPage,
    Folio,
    Activity,
    ActivityControl,
    Thread,
    Messenger,
    RMessenger,
}

impl CapType {
    fn from_bits(bits: u128) -> CapType {
        use CapType::*;
        match bits {
            0 => Void,
            1 => Page,
            2 => RPage,
            3 => CapPage,
            4 => RCapPage,
            5 => Folio,
            6 => Activity,
            7 => ActivityControl,
            8 => Thread,
            9 => Messenger,
            10 => RMessenger,
            _ => Void,
        }
    }

    fn to_bits(self) -> u128 {
        use CapType::*;
        match self {
            Void => 0,
            Page => 1,
            RPage => 2,
            CapPage => 3,
            RCapPage => 4,
            Folio => 5,
            Activity => 6,
            ActivityControl => 7,
            Thread => 8,
            Messenger => 9,
            RMessenger => 10,
        }
    }

    /// `true` for the weakened (`r*`) forms.
    pub fn is_weak(self) -> bool {
        matches!(self, CapType::RPage | CapType::RCapPage | CapType::RMessenger)
    }

    /// Weakening is idempotent (§3).
    pub fn weaken(self) -> CapType {
        match self {
            CapType::Page => CapType::RPage,
            CapType::CapPage => CapType::RCapPage,
            CapType::Messenger => CapType::RMessenger,
            other => other,
        }
    }

    /// `true` for a pair that the requested-type check in `lookup`
    /// accepts: exact match, or the weak form of `expected` (§4.3 step 4).
    pub fn compatible_with(self, expected: CapType) -> bool {
        self == expected || self == expected.weaken()
    }

    /// `true` when this type consumes address bits by indexing into a
    /// cappage, folio, or fixed-width object slot table (§4.3 step 2).
    pub fn translates(self) -> bool {
        matches!(
            self,
            CapType::CapPage
                | CapType::RCapPage
                | CapType::Folio
                | CapType::Thread
                | CapType::Messenger
                | CapType::RMessenger
        )
    }
}

/// `{ discardable, priority }` (§3 Capability slot `policy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub discardable: bool,
    pub priority: i8,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            discardable: false,
            priority: 0,
        }
    }
}

/// The guarded page-table descriptor carried by a slot (§3 `addr_trans`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddrTrans {
    pub guard: u32,
    pub guard_bits: u8,
    pub subpage_index: u16,
    pub subpage_count: u16,
}

/// The object a slot designates, on the resource-manager side: `(oid,
/// version)` (§3 Capability slot). OIDs are 54-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Designation {
    pub oid: u64,
    pub version: u32,
}

/// A fixed-size capability cell (§3).
#[derive(Clone, Copy)]
pub struct CapSlot(LocalRegisterCopy<u128, CapSlotBits::Register>);

impl PartialEq for CapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.0.get() == other.0.get()
    }
}
impl Eq for CapSlot {}

impl fmt::Debug for CapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapSlot")
            .field("type", &self.cap_type())
            .field("policy", &self.policy())
            .field("addr_trans", &self.addr_trans())
            .field("designation", &self.designation())
            .finish()
    }
}

impl Default for CapSlot {
    fn default() -> Self {
        CapSlot::void()
    }
}

impl CapSlot {
    /// The empty slot: `type = void`, no designation.
    pub fn void() -> Self {
        CapSlot(LocalRegisterCopy::new(0))
    }

    pub fn new(
        ty: CapType,
        policy: Policy,
        addr_trans: AddrTrans,
        designation: Designation,
    ) -> Self {
        let mut slot = CapSlot::void();
        slot.set_type(ty);
        slot.set_policy(policy);
        slot.set_addr_trans(addr_trans);
        slot.set_designation(designation);
        slot
    }

    pub fn cap_type(&self) -> CapType {
        CapType::from_bits(self.0.read(CapSlotBits::Type))
    }

    pub fn set_type(&mut self, ty: CapType) {
        self.0.modify(CapSlotBits::Type.val(ty.to_bits()));
    }

    pub fn is_void(&self) -> bool {
        self.cap_type() == CapType::Void
    }

    pub fn policy(&self) -> Policy {
        Policy {
            discardable: self.0.read(CapSlotBits::Discardable) != 0,
            priority: Self::priority_from_bits(self.0.read(CapSlotBits::PriorityBits) as u8),
        }
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.0
            .modify(CapSlotBits::Discardable.val(policy.discardable as u128));
        self.0.modify(
            CapSlotBits::PriorityBits.val(Self::priority_to_bits(policy.priority) as u128),
        );
    }

    fn priority_to_bits(p: i8) -> u8 {
        (p as i16 & 0x7f) as u8
    }

    fn priority_from_bits(bits: u8) -> i8 {
        // Sign-extend a 7-bit two's complement value.
        ((bits << 1) as i8) >> 1
    }

    pub fn addr_trans(&self) -> AddrTrans {
        AddrTrans {
            guard: self.0.read(CapSlotBits::Guard) as u32,
            guard_bits: self.0.read(CapSlotBits::GuardBits) as u8,
            subpage_index: self.0.read(CapSlotBits::SubpageIndex) as u16,
            subpage_count: 1u16 << self.0.read(CapSlotBits::SubpageCountLog2),
        }
    }

    pub fn set_addr_trans(&mut self, at: AddrTrans) {
        self.0.modify(CapSlotBits::Guard.val(at.guard as u128));
        self.0
            .modify(CapSlotBits::GuardBits.val(at.guard_bits as u128));
        self.0
            .modify(CapSlotBits::SubpageIndex.val(at.subpage_index as u128));
        let count = at.subpage_count.max(1);
        debug_assert!(count.is_power_of_two(), "subpage_count must be a power of two");
        self.0
            .modify(CapSlotBits::SubpageCountLog2.val(count.trailing_zeros() as u128));
    }

    pub fn designation(&self) -> Designation {
        Designation {
            oid: self.0.read(CapSlotBits::Oid) as u64,
            version: self.0.read(CapSlotBits::Version) as u32,
        }
    }

    pub fn set_designation(&mut self, d: Designation) {
        self.0.modify(CapSlotBits::Oid.val(d.oid as u128));
        self.0.modify(CapSlotBits::Version.val(d.version as u128));
    }

    /// Produce a weakened copy of this slot (§6 `CAP_COPY` `WEAKEN` flag).
    pub fn weakened(&self) -> CapSlot {
        let mut copy = *self;
        copy.set_type(self.cap_type().weaken());
        copy
    }
}
