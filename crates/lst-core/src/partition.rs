use crate::CoreError;

/// Splits `items` into `shards` contiguous, order-preserving chunks using
/// the boundaries `i*n/k .. (i+1)*n/k`. Chunk sizes differ by at most one and
/// trailing shards may be empty when `shards > items.len()`.
pub fn partition<T: Clone>(items: &[T], shards: usize) -> Result<Vec<Vec<T>>, CoreError> {
    if shards == 0 {
        return Err(CoreError::ZeroShards);
    }
    let n = items.len();
    Ok((0..shards)
        .map(|i| items[i * n / shards..(i + 1) * n / shards].to_vec())
        .collect())
}
