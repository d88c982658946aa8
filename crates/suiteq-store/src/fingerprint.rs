//! Timing-set fingerprints.
//!
//! A fingerprint is captured when a build is scheduled and compared again
//! before the build's timings are folded into the global history. Builds
//! scheduled from a different timing set never overwrite each other.

use sha2::{Digest, Sha256};

/// Content hash of a timing set.
///
/// Entries are ordered by duration, then by job, so the result does not
/// depend on iteration order.
pub fn fingerprint<'a, I>(timings: I) -> String
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut entries: Vec<(&str, f64)> = timings.into_iter().collect();
    entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

    let mut hasher = Sha256::new();
    for (job, duration) in entries {
        hasher.update(job.as_bytes());
        hasher.update(b"\n");
        hasher.update(duration.to_bits().to_be_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
