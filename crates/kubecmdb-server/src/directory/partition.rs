//! ShardPartitioner
//!
//! Replica `ordinal` of `replicas` owns
//! `sorted[ordinal * n / replicas .. (ordinal + 1) * n / replicas]`.
//! Slices are contiguous and together cover the list exactly once. With
//! more replicas than clusters some replicas own nothing.

/// Slice of `sorted` owned by replica `ordinal`.
///
/// A zero replica count or an out-of-range ordinal owns nothing.
pub fn assign<T>(sorted: &[T], replicas: usize, ordinal: usize) -> &[T] {
    if replicas == 0 || ordinal >= replicas {
        return &[];
    }
    let n = sorted.len();
    let start = ordinal * n / replicas;
    let end = (ordinal + 1) * n / replicas;
    &sorted[start..end]
}
