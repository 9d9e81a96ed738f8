//! A placeholder [`rm_mm::AccessSampler`]: the real one reads and
//! clears a frame's hardware referenced/dirty bits and issues a global
//! unmap, both of which require the specific microkernel's IPC/MMU
//! binding that spec.md's Non-goals leave uncommitted ("No commitment
//! to the particular microkernel IPC encoding beyond the abstractions
//! in §6"). This stub lets the ager thread run end-to-end in this
//! port; a real binding replaces it without touching `rm-mm`.

use rm_mm::AccessSampler;

pub struct NullSampler;

impl AccessSampler for NullSampler {
    fn sample_and_clear(&mut self, _oid: u64) -> (bool, bool) {
        (false, false)
    }

    fn unmap_all(&mut self) {
        log::trace!("sampler: unmap_all (no-op placeholder binding)");
    }
}
