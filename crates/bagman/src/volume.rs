//! In-process free-space accounting (spec §4.3).
//!
//! The arbiter snapshots free bytes on the working volume once at
//! construction and never consults the OS again — long-running deployments
//! are expected to restart the worker periodically to bound the drift
//! between the snapshot and reality (spec §9 open question: this drift is
//! accepted, not mitigated).

use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("not enough space: requested {requested} bytes, {available} available")]
    NotEnoughSpace { requested: u64, available: u64 },
}

struct Inner {
    initial_free: u64,
    claimed: u64,
}

/// Mutex-guarded counter of bytes claimed against the volume's free space at
/// startup.
pub struct VolumeArbiter {
    inner: Mutex<Inner>,
}

impl VolumeArbiter {
    pub fn new(initial_free: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                initial_free,
                claimed: 0,
            }),
        }
    }

    /// Build an arbiter from a free-byte snapshot already taken for `path`.
    ///
    /// The workspace forbids `unsafe_code`, so Bagman does not call into a
    /// raw `statvfs`/`GetDiskFreeSpaceEx` binding to take that snapshot
    /// itself; `bagman-cli` takes it once at process start (via
    /// `bagman::config::query_free_bytes`, a thin wrapper callers can swap
    /// for a platform crate) and passes the number in here. The arbiter's
    /// contract — snapshot once, never re-query — is unaffected by where
    /// the snapshot comes from.
    pub fn for_free_bytes(_path: &Path, free_bytes: u64) -> Self {
        Self::new(free_bytes)
    }

    /// Reserve `n` bytes. Fails without mutating state if doing so would
    /// drive `claimed` above `initial_free`.
    pub fn reserve(&self, n: u64) -> Result<(), VolumeError> {
        let mut inner = self.inner.lock().unwrap();
        let available = inner.initial_free.saturating_sub(inner.claimed);
        if n > available {
            return Err(VolumeError::NotEnoughSpace {
                requested: n,
                available,
            });
        }
        inner.claimed += n;
        Ok(())
    }

    /// Release `n` previously-reserved bytes. Panics on underflow: that
    /// indicates a release without a matching reserve, a usage bug per
    /// spec §7's "Usage/bug -> fail fast" row.
    pub fn release(&self, n: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.claimed = inner
            .claimed
            .checked_sub(n)
            .expect("volume arbiter: release exceeded claimed bytes");
    }

    pub fn claimed(&self) -> u64 {
        self.inner.lock().unwrap().claimed
    }

    pub fn initial_free(&self) -> u64 {
        self.inner.lock().unwrap().initial_free
    }
}

/// Every fetch reserves `2 * expected_size` to cover both the tar file and
/// its untarred expansion (spec §4.3 "Reservation convention").
pub fn fetch_reservation(expected_size: u64) -> u64 {
    expected_size.saturating_mul(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release_round_trip() {
        let arb = VolumeArbiter::new(1000);
        arb.reserve(400).unwrap();
        assert_eq!(arb.claimed(), 400);
        arb.release(400);
        assert_eq!(arb.claimed(), 0);
    }

    #[test]
    fn reserve_fails_when_it_would_exceed_free_space() {
        let arb = VolumeArbiter::new(1000);
        arb.reserve(900).unwrap();
        let err = arb.reserve(200).unwrap_err();
        assert!(matches!(err, VolumeError::NotEnoughSpace { .. }));
        // failed reservation must not mutate claimed
        assert_eq!(arb.claimed(), 900);
    }

    #[test]
    #[should_panic]
    fn release_without_matching_reserve_panics() {
        let arb = VolumeArbiter::new(1000);
        arb.release(1);
    }

    #[test]
    fn fetch_reservation_doubles_size() {
        assert_eq!(fetch_reservation(100), 200);
    }

    proptest::proptest! {
        #[test]
        fn monotonicity_holds_for_any_matched_interleaving(
            ops in proptest::collection::vec(1u64..500, 1..40)
        ) {
            // property 3: for any interleaving of matched reserve/release
            // pairs, final claimed == 0 and no reserve ever drives
            // claimed above initial_free.
            let arb = VolumeArbiter::new(10_000);
            for n in &ops {
                if arb.reserve(*n).is_ok() {
                    proptest::prop_assert!(arb.claimed() <= arb.initial_free());
                    arb.release(*n);
                }
            }
            proptest::prop_assert_eq!(arb.claimed(), 0);
        }
    }
}
