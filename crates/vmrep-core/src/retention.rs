/// Select the entries that fall outside a retention window.
///
/// `entries` must be sorted oldest first. The newest `max(retention, 1)`
/// entries are kept, so the most recent entry is never selected even when
/// `retention` is 0. Returns the oldest excess entries, in input order.
pub fn select_expired<T>(entries: &[T], retention: usize) -> &[T] {
    let keep = retention.max(1);
    let expired = entries.len().saturating_sub(keep);
    &entries[..expired]
}

/// Same as [`select_expired`] for a writer that is about to add one more entry:
/// keeps `retention - 1` existing entries, still never fewer than one.
pub fn select_expired_before_write<T>(entries: &[T], retention: usize) -> &[T] {
    select_expired(entries, retention.saturating_sub(1))
}
