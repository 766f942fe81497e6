/// FNV-1a digest of `parts` in order, never zero.
///
/// Used wherever every rank must derive the same identifier without
/// messaging: communicator ids after a split and node-name digests in the
/// locality exchange. Zero is reserved for the root communicator.
pub(crate) fn fnv1a<I, S>(parts: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut h: u64 = 0xcbf29ce484222325; // FNV-1a offset basis
    for part in parts {
        for &b in part.as_ref() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
    }
    if h == 0 { 1 } else { h }
}
