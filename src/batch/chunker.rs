use crate::error::Error;

/// Split `items` into ordered groups of at most `max_size`
///
/// Concatenating the groups yields the input. An empty input yields no
/// groups, and no group is ever empty.
pub fn chunk<T>(items: Vec<T>, max_size: usize) -> Result<Vec<Vec<T>>, Error> {
    if max_size == 0 {
        return Err(Error::InvalidConfig("chunk size must be at least 1".into()));
    }

    let mut chunks = Vec::with_capacity(items.len().div_ceil(max_size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(max_size).collect());
    }
    Ok(chunks)
}
