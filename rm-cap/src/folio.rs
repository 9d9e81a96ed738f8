/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! Folio layout: the on-disk/in-memory unit of storage allocation (§3
//! Folio, §6 Persistent state).

use rm_proto::FOLIO_OBJECTS;

/// Per-object header entry stored in a folio's metadata page (§6
/// Persistent state: `{ type: 4b, content_present: 1b, discardable: 1b,
/// version: 20b, checksum: 32b, reserved }`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub ty: crate::slot::CapType,
    pub content_present: bool,
    pub discardable: bool,
    pub version: u32,
    /// Running CRC32 over the object's page, recomputed on every write
    /// (§3 SPEC_FULL supplement, grounded on `libhurd-mm/store.c`'s
    /// checksum-on-write discipline).
    pub checksum: u32,
}

impl Default for ObjectHeader {
    fn default() -> Self {
        ObjectHeader {
            ty: crate::slot::CapType::Void,
            content_present: false,
            discardable: false,
            version: 0,
            checksum: 0,
        }
    }
}

impl ObjectHeader {
    /// Recompute [`Self::checksum`] over `page`, called on every write-back.
    pub fn update_checksum(&mut self, page: &[u8]) {
        self.checksum = crc32fast::hash(page);
        self.content_present = true;
    }

    pub fn verify_checksum(&self, page: &[u8]) -> bool {
        crc32fast::hash(page) == self.checksum
    }
}

/// A folio: a metadata header plus [`FOLIO_OBJECTS`] object pages, each
/// independently typed (§3 Folio).
#[derive(Debug, Clone)]
pub struct FolioHeader {
    /// The OID of object 0 (`folio_base_oid`); the header page itself
    /// does not consume an OID.
    pub base_oid: u64,
    pub policy: crate::slot::Policy,
    pub objects: Vec<ObjectHeader>,
}

impl FolioHeader {
    pub fn new(base_oid: u64, policy: crate::slot::Policy) -> Self {
        FolioHeader {
            base_oid,
            policy,
            objects: vec![ObjectHeader::default(); FOLIO_OBJECTS],
        }
    }

    /// Object `k`'s OID: `F + 1 + k` (§3 Folio).
    pub fn oid_of(&self, k: usize) -> u64 {
        debug_assert!(k < FOLIO_OBJECTS);
        self.base_oid + 1 + k as u64
    }

    /// Inverse of [`Self::oid_of`]: which slot (if any) of this folio an
    /// OID names.
    pub fn slot_of(&self, oid: u64) -> Option<usize> {
        let rel = oid.checked_sub(self.base_oid + 1)?;
        if (rel as usize) < FOLIO_OBJECTS {
            Some(rel as usize)
        } else {
            None
        }
    }

    /// `(oid, version)` resolves to a live object iff the folio's
    /// recorded version for that slot matches and the type is not
    /// `void` (§3 Invariants).
    pub fn is_live(&self, k: usize, version: u32) -> bool {
        let hdr = &self.objects[k];
        hdr.ty != crate::slot::CapType::Void && hdr.version == version
    }

    /// Replace slot `k`'s type, bumping its version if it previously
    /// held a live object (§4.2 `folio_object_alloc`). Allocating
    /// `CapType::Void` is `folio_object_free`.
    pub fn set_object(&mut self, k: usize, ty: crate::slot::CapType, policy: crate::slot::Policy) {
        self.set_object_versioned(k, ty, policy, true);
    }

    /// §4.2 Versioning algorithm: if no capability naming the slot's old
    /// `(oid, version)` has ever left the address space, eviction alone
    /// invalidates in-memory capabilities and the on-disk version is
    /// left untouched; otherwise (`escaped`) it is bumped. Callers that
    /// track escape conservatively (`rm-mm`) use this directly;
    /// [`Self::set_object`] always bumps, for callers with no such
    /// tracking.
    pub fn set_object_versioned(
        &mut self,
        k: usize,
        ty: crate::slot::CapType,
        policy: crate::slot::Policy,
        escaped: bool,
    ) {
        let hdr = &mut self.objects[k];
        if hdr.ty != crate::slot::CapType::Void && escaped {
            hdr.version = (hdr.version + 1) % (1 << rm_proto::CAP_VERSION_BITS);
        }
        hdr.ty = ty;
        hdr.discardable = policy.discardable;
        hdr.content_present = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::{CapType, Policy};

    #[test]
    fn oid_round_trip() {
        let folio = FolioHeader::new(1000, Policy::default());
        assert_eq!(folio.oid_of(0), 1001);
        assert_eq!(folio.slot_of(1001), Some(0));
        assert_eq!(folio.slot_of(1000), None);
        assert_eq!(folio.slot_of(1000 + FOLIO_OBJECTS as u64 + 1), None);
    }

    #[test]
    fn version_bumps_only_when_previously_live() {
        let mut folio = FolioHeader::new(0, Policy::default());
        folio.set_object(0, CapType::Page, Policy::default());
        assert_eq!(folio.objects[0].version, 0);
        folio.set_object(0, CapType::Page, Policy::default());
        assert_eq!(folio.objects[0].version, 1);
        folio.set_object(0, CapType::Void, Policy::default());
        assert_eq!(folio.objects[0].version, 2);
        assert!(!folio.is_live(0, 2));
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut hdr = ObjectHeader::default();
        let page = vec![0xAAu8; 4096];
        hdr.update_checksum(&page);
        assert!(hdr.verify_checksum(&page));
        let mut corrupted = page.clone();
        corrupted[0] ^= 0xFF;
        assert!(!hdr.verify_checksum(&corrupted));
    }
}
